use lettre::message::{
    header::{ContentType, HeaderName, HeaderValue},
    Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart,
};
use lettre::{Address, Message};

use super::{ErrorCategory, OutboundEmail, ProviderError};

/// Headers the builder owns; custom values for these are ignored.
const RESERVED_HEADERS: &[&str] = &[
    "from",
    "to",
    "cc",
    "bcc",
    "subject",
    "reply-to",
    "date",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "message-id",
];

fn parse_address(raw: &str, role: &str) -> Result<Address, ProviderError> {
    raw.trim().parse::<Address>().map_err(|e| {
        ProviderError::new(
            ErrorCategory::InvalidEmail,
            format!("invalid {role} address {raw:?}: {e}"),
        )
    })
}

/// Builds the raw RFC 5322 message for `email`: an HTML body, optionally
/// wrapped in `multipart/mixed` with one attachment.
pub fn build_mime(email: &OutboundEmail) -> Result<Vec<u8>, ProviderError> {
    let from_name = email.from_name.trim();
    let from = Mailbox::new(
        (!from_name.is_empty()).then(|| from_name.to_string()),
        parse_address(&email.from_email, "sender")?,
    );
    let to = Mailbox::new(None, parse_address(&email.to, "recipient")?);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(email.subject.clone());

    if let Some(reply_to) = email.reply_to.as_deref().filter(|s| !s.trim().is_empty()) {
        builder = builder.reply_to(Mailbox::new(None, parse_address(reply_to, "reply-to")?));
    }

    for (name, value) in &email.headers {
        if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let header_name = HeaderName::new_from_ascii(name.clone()).map_err(|_| {
            ProviderError::new(
                ErrorCategory::ProviderError,
                format!("invalid header name {name:?}"),
            )
        })?;
        let clean = value.replace(['\r', '\n'], " ");
        builder = builder.raw_header(HeaderValue::new(header_name, clean));
    }

    let html = SinglePart::html(email.html_body.clone());

    let message = match &email.attachment {
        Some(att) => {
            let content_type = ContentType::parse(&att.content_type)
                .or_else(|_| ContentType::parse("application/octet-stream"))
                .map_err(|e| {
                    ProviderError::new(ErrorCategory::ProviderError, format!("content type: {e}"))
                })?;
            let part = MimeAttachment::new(att.file_name.clone()).body(att.bytes.clone(), content_type);
            builder.multipart(MultiPart::mixed().singlepart(html).singlepart(part))
        }
        None => builder.singlepart(html),
    }
    .map_err(|e| ProviderError::new(ErrorCategory::ProviderError, format!("mime build: {e}")))?;

    Ok(message.formatted())
}
