//! Outbound email delivery, IMAP fetching and inbound RFC 822 parsing.

mod imap;
mod parse;
mod sendgrid;
mod smtp;

pub use imap::{FetchedMail, ImapConfig, fetch_unseen_imap, mark_seen_imap};
pub use parse::{parse_rfc822, strip_html};
pub use sendgrid::SendGridMailer;
pub use smtp::{SmtpConfig, SmtpMailer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// A reply ready to hand to a mail provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message id of the email being answered, for threading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

/// Transactional email sender.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Provider name, for logging.
    fn name(&self) -> &str;

    /// Send one email and return the provider's delivery id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError>;
}
