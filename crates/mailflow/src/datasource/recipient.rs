use serde_json::Value;

use super::{value_text, Row};

const KEY_COLUMNS: &[&str] = &["PRIMARY_KEY", "ID"];
const EMAIL_COLUMNS: &[&str] = &["EMAIL", "RECIPIENT_EMAIL"];
const ATTACHMENT_COLUMNS: &[&str] = &["ATTACH_FILE_NAME", "ATTACHMENT"];

/// A recipient row with its well-known columns pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    /// `PRIMARY_KEY`, else `ID`, else the first column.
    pub key: Value,
    pub email: Option<String>,
    pub attachment: Option<String>,
    pub row: Row,
}

impl Recipient {
    pub fn from_row(row: Row) -> Self {
        let key = lookup(&row, KEY_COLUMNS)
            .or_else(|| row.values().next().filter(|v| present(v)))
            .cloned()
            .unwrap_or(Value::Null);
        let email = lookup(&row, EMAIL_COLUMNS).map(|v| value_text(v).trim().to_string());
        let attachment = lookup(&row, ATTACHMENT_COLUMNS).map(value_text);

        Self {
            key,
            email,
            attachment,
            row,
        }
    }

    pub fn key_text(&self) -> String {
        value_text(&self.key)
    }
}

fn present(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// First non-empty value among `names`, matched case-insensitively.
fn lookup<'a>(row: &'a Row, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        row.iter()
            .find(|(col, v)| col.eq_ignore_ascii_case(name) && present(v))
            .map(|(_, v)| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn well_known_columns_any_case() {
        let r = Recipient::from_row(row(json!({
            "id": 7, "email": " kim@example.com ", "attachment": "7.pdf"
        })));
        assert_eq!(r.key, json!(7));
        assert_eq!(r.email.as_deref(), Some("kim@example.com"));
        assert_eq!(r.attachment.as_deref(), Some("7.pdf"));
    }

    #[test]
    fn key_falls_back_to_first_column() {
        let r = Recipient::from_row(row(json!({"CUST_NO": "C-1", "RECIPIENT_EMAIL": "a@b.co"})));
        assert_eq!(r.key_text(), "C-1");
        assert_eq!(r.email.as_deref(), Some("a@b.co"));
        assert_eq!(r.attachment, None);
    }

    #[test]
    fn blank_email_is_missing() {
        let r = Recipient::from_row(row(json!({"ID": 1, "EMAIL": "  "})));
        assert_eq!(r.email, None);
    }
}
