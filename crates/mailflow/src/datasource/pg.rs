use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::types::Json;
use sqlx::{Arguments, PgPool, Postgres};

use super::{DataSource, Row};

/// Runs recipient, mapping and update statements against Postgres.
///
/// Query results go through `row_to_json` so any select list comes back as a
/// JSON object in column order, whatever the column types are.
#[derive(Clone)]
pub struct PgDataSource {
    pool: PgPool,
}

impl PgDataSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn wrap(sql: &str) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!("SELECT row_to_json(t) FROM ({inner}) t")
}

/// Positional parameters, typed from their JSON shape.
fn arguments(params: &[Value]) -> PgArguments {
    let mut args = PgArguments::default();
    for v in params {
        match v {
            Value::Null => args.add(None::<String>),
            Value::Bool(b) => args.add(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => args.add(i),
                None => args.add(n.as_f64()),
            },
            Value::String(s) => args.add(s.clone()),
            other => args.add(Json(other.clone())),
        }
    }
    args
}

#[async_trait]
impl DataSource for PgDataSource {
    async fn query(&self, sql: &str, params: &[Value]) -> anyhow::Result<Vec<Row>> {
        let wrapped = wrap(sql);
        let values: Vec<Value> = sqlx::query_scalar_with::<Postgres, Value, _>(&wrapped, arguments(params))
            .fetch_all(&self.pool)
            .await?;
        values
            .into_iter()
            .map(|v| match v {
                Value::Object(row) => Ok(row),
                other => anyhow::bail!("row_to_json returned non-object: {other}"),
            })
            .collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> anyhow::Result<u64> {
        let res = sqlx::query_with::<Postgres, _>(sql, arguments(params))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::wrap;

    #[test]
    fn wraps_and_strips_terminator() {
        assert_eq!(
            wrap(" SELECT id, email FROM customers; "),
            "SELECT row_to_json(t) FROM (SELECT id, email FROM customers) t"
        );
    }
}
