//! SendGrid v3 mail-send adapter.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::mail::{Mailer, OutboundEmail};

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";

pub struct SendGridMailer {
    api_key: SecretString,
    from_address: String,
    url: String,
    client: reqwest::Client,
}

impl SendGridMailer {
    pub fn new(api_key: SecretString, from_address: impl Into<String>) -> Self {
        Self {
            api_key,
            from_address: from_address.into(),
            url: SENDGRID_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn body(&self, email: &OutboundEmail) -> serde_json::Value {
        let mut body = serde_json::json!({
            "personalizations": [{ "to": [{ "email": email.to }] }],
            "from": { "email": self.from_address },
            "subject": email.subject,
            "content": [{ "type": "text/plain", "value": email.body }],
        });
        if let Some(parent) = &email.in_reply_to {
            body["headers"] = serde_json::json!({
                "In-Reply-To": parent,
                "References": parent,
            });
        }
        body
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    fn name(&self) -> &str {
        "sendgrid"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.body(email))
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                provider: "sendgrid".into(),
                reason: e.to_string(),
            })?;

        // SendGrid accepts with 202 and no body.
        if resp.status() != reqwest::StatusCode::ACCEPTED {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::SendFailed {
                provider: "sendgrid".into(),
                reason: format!("status {status}: {text}"),
            });
        }

        let id = resp
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| format!("sendgrid-{}", Uuid::new_v4()));
        tracing::info!(to = %email.to, delivery_id = %id, "Email accepted by SendGrid");
        Ok(id)
    }
}
