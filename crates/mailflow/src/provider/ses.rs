use async_trait::async_trait;
use aws_sdk_sesv2::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{Destination, EmailContent, RawMessage},
    Client,
};

use super::{
    message::build_mime, EmailProvider, ErrorCategory, OutboundEmail, ProviderError, Quota,
    SendReceipt,
};

/// Amazon SES v2, sending pre-built raw MIME so attachments and custom
/// headers pass through untouched.
pub struct SesProvider {
    client: Client,
}

impl SesProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Uses the default AWS credential chain and region resolution.
    pub async fn from_env() -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::new(Client::new(&config))
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = DisplayErrorContext(&err).to_string();

    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            if detail.to_lowercase().contains("credential") {
                ProviderError::new(ErrorCategory::CredentialsError, detail)
            } else {
                ProviderError::new(ErrorCategory::NetworkError, detail)
            }
        }
        _ => {
            let message = err.message().map(str::to_string).unwrap_or(detail);
            ProviderError::classified(err.code(), message)
        }
    }
}

#[async_trait]
impl EmailProvider for SesProvider {
    fn name(&self) -> &'static str {
        "ses"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError> {
        let raw = build_mime(email)?;

        let raw_message = RawMessage::builder()
            .data(Blob::new(raw))
            .build()
            .map_err(|e| ProviderError::new(ErrorCategory::ProviderError, e.to_string()))?;

        let out = self
            .client
            .send_email()
            .from_email_address(email.from_email.clone())
            .destination(Destination::builder().to_addresses(email.to.clone()).build())
            .content(EmailContent::builder().raw(raw_message).build())
            .send()
            .await
            .map_err(map_sdk_error)?;

        let message_id = out
            .message_id()
            .map(str::to_string)
            .unwrap_or_else(|| format!("ses-{}", uuid::Uuid::new_v4()));

        Ok(SendReceipt { message_id })
    }

    async fn quota(&self) -> Result<Quota, ProviderError> {
        let out = self
            .client
            .get_account()
            .send()
            .await
            .map_err(map_sdk_error)?;

        let Some(q) = out.send_quota() else {
            return Ok(Quota::new(0.0, 0.0, 1.0));
        };

        Ok(Quota::new(
            q.max24_hour_send(),
            q.sent_last24_hours(),
            q.max_send_rate(),
        ))
    }
}
