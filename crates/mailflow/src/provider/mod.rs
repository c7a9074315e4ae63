//! Outbound email delivery.

pub mod classify;
pub mod log;
pub mod message;
pub mod ses;

pub use classify::{classify, ErrorCategory};
pub use log::LogProvider;
pub use ses::SesProvider;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// A fully rendered message for one recipient.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub headers: BTreeMap<String, String>,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub max24_hour_send: f64,
    pub sent_last24_hours: f64,
    pub remaining: f64,
    pub max_send_rate: f64,
}

impl Quota {
    pub fn new(max24_hour_send: f64, sent_last24_hours: f64, max_send_rate: f64) -> Self {
        Self {
            max24_hour_send,
            sent_last24_hours,
            remaining: (max24_hour_send - sent_last24_hours).max(0.0),
            max_send_rate,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{category}: {message}")]
pub struct ProviderError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ProviderError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Classifies a raw provider failure.
    pub fn classified(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            category: classify(code, &message),
            message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError>;

    async fn quota(&self) -> Result<Quota, ProviderError>;
}
