//! Query Executor
//!
//! Runs sanitized SQL and decides how the rows travel back: inline in the
//! `data` event when small, or as a reference the client re-fetches through
//! `/execute-sql` when larger than the inline limit.

use crate::error::Result;
use crate::sql_guard::SanitizedSql;
use crate::store::{QueryStore, Row};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub sql: String,
}

/// How a result is shipped to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Inline { data: Vec<Row>, count: usize },
    FetchViaApi { sql: String, count: usize },
}

impl Delivery {
    pub fn count(&self) -> usize {
        match self {
            Delivery::Inline { count, .. } | Delivery::FetchViaApi { count, .. } => *count,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Delivery::Inline { .. })
    }

    /// Payload of the `data` event.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            Delivery::Inline { data, count } => serde_json::json!({
                "data": data,
                "count": count,
            }),
            Delivery::FetchViaApi { sql, count } => serde_json::json!({
                "sql": sql,
                "count": count,
                "fetchViaApi": true,
            }),
        }
    }
}

pub struct QueryExecutor {
    store: Arc<dyn QueryStore>,
    inline_row_limit: usize,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn QueryStore>, inline_row_limit: usize) -> Self {
        Self {
            store,
            inline_row_limit,
        }
    }

    pub fn inline_row_limit(&self) -> usize {
        self.inline_row_limit
    }

    pub async fn execute(&self, sql: &SanitizedSql) -> Result<ExecutionResult> {
        let started = Instant::now();
        let rows = self.store.fetch_rows(sql).await?;
        let row_count = rows.len();
        info!(
            "Query returned {} rows in {} ms",
            row_count,
            started.elapsed().as_millis()
        );
        Ok(ExecutionResult {
            rows,
            row_count,
            sql: sql.as_str().to_string(),
        })
    }

    /// Inline up to the limit (inclusive), reference beyond it.
    pub fn delivery(&self, result: &ExecutionResult) -> Delivery {
        if result.row_count > self.inline_row_limit {
            Delivery::FetchViaApi {
                sql: result.sql.clone(),
                count: result.row_count,
            }
        } else {
            Delivery::Inline {
                data: result.rows.clone(),
                count: result.row_count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlqError;
    use crate::store::ExampleValues;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedRows(usize);

    #[async_trait]
    impl QueryStore for FixedRows {
        async fn fetch_rows(&self, _sql: &SanitizedSql) -> Result<Vec<Row>> {
            Ok((0..self.0)
                .map(|i| json!({ "id": i }).as_object().cloned().unwrap_or_default())
                .collect())
        }

        async fn sample_values(&self) -> Result<ExampleValues> {
            Ok(ExampleValues::new())
        }
    }

    struct Broken;

    #[async_trait]
    impl QueryStore for Broken {
        async fn fetch_rows(&self, _sql: &SanitizedSql) -> Result<Vec<Row>> {
            Err(NlqError::SqlExecution("relation \"studnets\" does not exist".to_string()))
        }

        async fn sample_values(&self) -> Result<ExampleValues> {
            Ok(ExampleValues::new())
        }
    }

    fn sql() -> SanitizedSql {
        SanitizedSql::from_trusted("SELECT id FROM students WHERE school_id = 's1'".to_string())
    }

    #[tokio::test]
    async fn hundred_rows_are_inline_hundred_and_one_are_not() {
        let at_limit = QueryExecutor::new(Arc::new(FixedRows(100)), 100);
        let result = at_limit.execute(&sql()).await.unwrap();
        let delivery = at_limit.delivery(&result);
        assert!(delivery.is_inline());
        assert_eq!(delivery.to_payload()["count"], 100);
        assert_eq!(delivery.to_payload()["data"].as_array().map(|a| a.len()), Some(100));

        let over = QueryExecutor::new(Arc::new(FixedRows(101)), 100);
        let result = over.execute(&sql()).await.unwrap();
        let payload = over.delivery(&result).to_payload();
        assert_eq!(payload["fetchViaApi"], true);
        assert_eq!(payload["count"], 101);
        assert_eq!(payload["sql"], sql().as_str());
        assert!(payload.get("data").is_none());
    }

    #[tokio::test]
    async fn store_errors_surface_as_execution_errors() {
        let executor = QueryExecutor::new(Arc::new(Broken), 100);
        let err = executor.execute(&sql()).await.unwrap_err();
        assert_eq!(err.kind(), "sql_execution");
    }
}
