//! The relational source recipients are read from and written back to.

pub mod memory;
pub mod pg;
pub mod recipient;

pub use memory::MemoryDataSource;
pub use pg::PgDataSource;
pub use recipient::Recipient;

use async_trait::async_trait;
use serde_json::Value;

/// One result row, columns in select order.
pub type Row = serde_json::Map<String, Value>;

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Runs a statement returning rows. Parameters bind positionally as `$1..$n`.
    async fn query(&self, sql: &str, params: &[Value]) -> anyhow::Result<Vec<Row>>;

    /// Runs a statement for its side effect and returns the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> anyhow::Result<u64>;
}

/// Plain text form of a column value: strings unquoted, null empty.
pub fn value_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_of_scalars() {
        assert_eq!(value_text(&json!("abc")), "abc");
        assert_eq!(value_text(&json!(42)), "42");
        assert_eq!(value_text(&json!(null)), "");
        assert_eq!(value_text(&json!(true)), "true");
    }
}
