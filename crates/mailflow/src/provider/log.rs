use async_trait::async_trait;
use tracing::info;

use super::{message::build_mime, EmailProvider, OutboundEmail, ProviderError, Quota, SendReceipt};

/// Development provider: builds the message, logs it, and reports success.
#[derive(Debug, Default, Clone)]
pub struct LogProvider;

#[async_trait]
impl EmailProvider for LogProvider {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError> {
        // Building still validates addresses and headers.
        let raw = build_mime(email)?;

        info!(
            to = %email.to,
            from = %email.from_email,
            subject = %email.subject,
            attachment = email.attachment.as_ref().map(|a| a.file_name.as_str()).unwrap_or("-"),
            bytes = raw.len(),
            "dev send"
        );

        Ok(SendReceipt {
            message_id: format!("dev-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn quota(&self) -> Result<Quota, ProviderError> {
        Ok(Quota::new(50_000.0, 0.0, 14.0))
    }
}
