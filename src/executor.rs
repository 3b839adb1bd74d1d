//! Query execution
//!
//! Runs validated SQL against Postgres using sqlx.

use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{debug, info};

pub type Row = Map<String, Value>;

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run(&self, sql: &str) -> Result<Vec<Row>>;
}

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("Database pool ready");
    Ok(pool)
}

/// Executes inside a read-only transaction that is always rolled back, and
/// caps the number of rows returned.
pub struct PgQueryExecutor {
    pool: PgPool,
    max_rows: u32,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool, max_rows: u32) -> Self {
        Self { pool, max_rows }
    }
}

/// Wrap a statement so the server returns at most `max_rows` rows as one JSON array.
pub fn wrap_for_json(sql: &str, max_rows: u32) -> String {
    let inner = sql.trim().trim_end_matches(';');
    format!(
        "SELECT COALESCE(json_agg(t), '[]'::json) FROM (SELECT * FROM ({}) AS q LIMIT {}) AS t",
        inner, max_rows
    )
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn run(&self, sql: &str) -> Result<Vec<Row>> {
        let wrapped = wrap_for_json(sql, self.max_rows);
        debug!("Executing: {}", wrapped);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let result: std::result::Result<Json<Value>, sqlx::Error> =
            sqlx::query_scalar(&wrapped).fetch_one(&mut *tx).await;

        tx.rollback().await?;

        let Json(value) = result.map_err(|e| QueryError::Execution(e.to_string()))?;
        let rows = match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Ok(map),
                    other => Err(QueryError::Execution(format!(
                        "Unexpected row shape: {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<Row>>>()?,
            other => {
                return Err(QueryError::Execution(format!(
                    "Unexpected result shape: {}",
                    other
                )))
            }
        };

        info!("Query returned {} rows", rows.len());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_for_json_caps_rows() {
        assert_eq!(
            wrap_for_json("SELECT s.school_name FROM llm_schools s;", 50),
            "SELECT COALESCE(json_agg(t), '[]'::json) FROM (SELECT * FROM (SELECT s.school_name FROM llm_schools s) AS q LIMIT 50) AS t"
        );
    }
}
