use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use super::{DataSource, Row};

enum Canned {
    Rows(Vec<Row>),
    /// Rows whose `column` equals the first parameter.
    Lookup { column: String, rows: Vec<Row> },
    Error(String),
}

/// Answers statements from canned results keyed by their exact text.
/// Unknown statements return no rows.
#[derive(Default)]
pub struct MemoryDataSource {
    canned: Mutex<HashMap<String, Canned>>,
    /// Per-statement failures for one first-parameter value.
    failing_params: Mutex<HashMap<String, Vec<(Value, String)>>>,
    executed: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, sql: &str, rows: Vec<Row>) -> Self {
        self.canned.lock().insert(sql.to_string(), Canned::Rows(rows));
        self
    }

    pub fn with_lookup(self, sql: &str, column: &str, rows: Vec<Row>) -> Self {
        self.canned.lock().insert(
            sql.to_string(),
            Canned::Lookup {
                column: column.to_string(),
                rows,
            },
        );
        self
    }

    pub fn with_error(self, sql: &str, message: &str) -> Self {
        self.canned
            .lock()
            .insert(sql.to_string(), Canned::Error(message.to_string()));
        self
    }

    /// Fails `sql` only when its first parameter equals `param`.
    pub fn with_error_for(self, sql: &str, param: Value, message: &str) -> Self {
        self.failing_params
            .lock()
            .entry(sql.to_string())
            .or_default()
            .push((param, message.to_string()));
        self
    }

    fn param_failure(&self, sql: &str, params: &[Value]) -> Option<String> {
        let first = params.first()?;
        self.failing_params
            .lock()
            .get(sql)?
            .iter()
            .find(|(param, _)| param == first)
            .map(|(_, msg)| msg.clone())
    }

    /// Statements passed to `execute`, in call order.
    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn query(&self, sql: &str, params: &[Value]) -> anyhow::Result<Vec<Row>> {
        if let Some(msg) = self.param_failure(sql, params) {
            anyhow::bail!("{msg}");
        }
        let canned = self.canned.lock();
        match canned.get(sql) {
            None => Ok(Vec::new()),
            Some(Canned::Rows(rows)) => Ok(rows.clone()),
            Some(Canned::Lookup { column, rows }) => {
                let key = params.first().unwrap_or(&Value::Null);
                Ok(rows
                    .iter()
                    .filter(|r| r.get(column) == Some(key))
                    .cloned()
                    .collect())
            }
            Some(Canned::Error(msg)) => anyhow::bail!("{msg}"),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> anyhow::Result<u64> {
        if let Some(Canned::Error(msg)) = self.canned.lock().get(sql) {
            anyhow::bail!("{msg}");
        }
        self.executed.lock().push((sql.to_string(), params.to_vec()));
        Ok(1)
    }
}
