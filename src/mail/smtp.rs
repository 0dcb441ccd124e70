//! SMTP delivery via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::mail::{Mailer, OutboundEmail};

/// SMTP settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (SMTP disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EXEC_ASSIST_FROM_ADDRESS")
            .or_else(|_| std::env::var("EMAIL_FROM_ADDRESS"))
            .unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                DeliveryError::InvalidAddress {
                    address: self.config.from_address.clone(),
                    reason: format!("{e}"),
                }
            })?)
            .to(email.to.parse().map_err(|e| DeliveryError::InvalidAddress {
                address: email.to.clone(),
                reason: format!("{e}"),
            })?)
            .subject(email.subject.clone())
            .message_id(Some(message_id.to_string()))
            .header(ContentType::TEXT_PLAIN);
        if let Some(parent) = &email.in_reply_to {
            builder = builder.in_reply_to(parent.clone()).references(parent.clone());
        }
        builder
            .body(email.body.clone())
            .map_err(|e| DeliveryError::SendFailed {
                provider: "smtp".into(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    /// Blocking send; run inside `spawn_blocking`.
    fn send_blocking(config: &SmtpConfig, message: &Message) -> Result<(), DeliveryError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| DeliveryError::SendFailed {
                provider: "smtp".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        transport
            .send(message)
            .map_err(|e| DeliveryError::SendFailed {
                provider: "smtp".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
        let message_id = format!("<{}@exec-assist>", Uuid::new_v4());
        let message = self.build_message(email, &message_id)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &message))
            .await
            .map_err(|e| DeliveryError::SendFailed {
                provider: "smtp".into(),
                reason: format!("send task failed: {e}"),
            })??;

        tracing::info!(to = %email.to, message_id = %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}
