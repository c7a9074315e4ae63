use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a recipient did not get their message.
///
/// The first seven come from the provider; the last three are raised while a
/// run is expanded and never reach the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    RateLimit,
    InvalidEmail,
    NotVerified,
    QuotaExceeded,
    CredentialsError,
    NetworkError,
    ProviderError,
    MappingError,
    TemplateError,
    MissingEmail,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        ErrorCategory::RateLimit,
        ErrorCategory::InvalidEmail,
        ErrorCategory::NotVerified,
        ErrorCategory::QuotaExceeded,
        ErrorCategory::CredentialsError,
        ErrorCategory::NetworkError,
        ErrorCategory::ProviderError,
        ErrorCategory::MappingError,
        ErrorCategory::TemplateError,
        ErrorCategory::MissingEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::InvalidEmail => "INVALID_EMAIL",
            ErrorCategory::NotVerified => "NOT_VERIFIED",
            ErrorCategory::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCategory::CredentialsError => "CREDENTIALS_ERROR",
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::ProviderError => "PROVIDER_ERROR",
            ErrorCategory::MappingError => "MAPPING_ERROR",
            ErrorCategory::TemplateError => "TEMPLATE_ERROR",
            ErrorCategory::MissingEmail => "MISSING_EMAIL",
        }
    }

    /// Only throttling and transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::RateLimit | ErrorCategory::NetworkError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown error category: {s}"))
    }
}

/// Maps a provider error code and message onto a category. Checks run in a
/// fixed order and the first match wins.
pub fn classify(code: Option<&str>, message: &str) -> ErrorCategory {
    let code = code.unwrap_or("");
    let lower = message.to_lowercase();

    if matches!(code, "Throttling" | "ThrottlingException" | "TooManyRequestsException")
        || lower.contains("rate exceeded")
    {
        return ErrorCategory::RateLimit;
    }

    if matches!(code, "InvalidParameterValue" | "BadRequestException")
        || lower.contains("invalid email")
        || lower.contains("invalid address")
    {
        return ErrorCategory::InvalidEmail;
    }

    if matches!(code, "MailFromDomainNotVerifiedException")
        || lower.contains("not verified")
        || lower.contains("verify")
    {
        return ErrorCategory::NotVerified;
    }

    if matches!(
        code,
        "LimitExceededException" | "SendingPausedException" | "AccountSuspendedException"
    ) || lower.contains("quota")
        || lower.contains("limit")
    {
        return ErrorCategory::QuotaExceeded;
    }

    if matches!(
        code,
        "CredentialsProviderError"
            | "UnrecognizedClientException"
            | "InvalidClientTokenId"
            | "SignatureDoesNotMatch"
            | "ExpiredTokenException"
    ) || lower.contains("credential")
    {
        return ErrorCategory::CredentialsError;
    }

    if lower.contains("enotfound")
        || lower.contains("etimedout")
        || lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("dns")
    {
        return ErrorCategory::NetworkError;
    }

    ErrorCategory::ProviderError
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_strings_round_trip() {
        for c in ErrorCategory::ALL {
            assert_eq!(c.as_str().parse::<ErrorCategory>().unwrap(), c);
        }
    }

    #[test]
    fn rate_limit_wins_over_quota() {
        assert_eq!(
            classify(None, "Rate exceeded, limit reached"),
            ErrorCategory::RateLimit
        );
    }
}
