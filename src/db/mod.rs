//! Statement execution against the backing store.
//!
//! The [`Executor`] trait is the only seam between the lifecycle logic and the
//! store. [`PgExecutor`] runs the statement text on a PostgreSQL pool, while
//! [`MemoryExecutor`] interprets the same typed statements against in-process
//! rows, which keeps tests deterministic and database-free.
//!
//! Rows travel as JSON objects keyed by column name so both executors produce the
//! same shape and callers decode them with serde.

pub mod memory;
pub mod postgres;

use crate::{
    Result,
    error::RowQueueError,
    job::{Job, JobId},
    plans::Statement,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use memory::{MemoryExecutor, MockClock};
pub use postgres::PgExecutor;

/// A positional statement parameter; the `n`th element binds to `$n`.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Uuid(uuid::Uuid),
    UuidArray(Vec<uuid::Uuid>),
    Text(Option<String>),
    Int(Option<i32>),
    Bool(bool),
    Json(Option<Value>),
    Timestamp(Option<DateTime<Utc>>),
}

pub type Row = serde_json::Map<String, Value>;

/// Rows returned by a statement and the number of rows it touched.
///
/// For statements that return rows, `row_count` is the number of rows returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

impl StatementResult {
    pub fn affected(row_count: u64) -> Self {
        Self {
            rows: Vec::new(),
            row_count,
        }
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }

    /// Decodes the `id` column of every row.
    pub fn ids(&self) -> Result<Vec<JobId>> {
        self.rows
            .iter()
            .map(|row| match row.get("id").and_then(Value::as_str) {
                Some(id) => Ok(id.parse::<JobId>()?),
                None => Err(RowQueueError::Store {
                    message: "row has no id column".to_string(),
                }),
            })
            .collect()
    }

    pub fn into_jobs(self) -> Result<Vec<Job>> {
        self.rows
            .into_iter()
            .map(|row| Ok(serde_json::from_value(Value::Object(row))?))
            .collect()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes one statement with positional parameters.
    async fn execute(&self, statement: &Statement, params: Vec<Param>) -> Result<StatementResult>;

    /// Executes parameterless statements in order inside one transaction.
    async fn execute_batch(&self, statements: &[Statement]) -> Result<()>;

    /// Releases the underlying connections. Further calls fail.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_result_ids() {
        let id = uuid::Uuid::new_v4();
        let mut row = Row::new();
        row.insert("id".to_string(), json!(id.to_string()));

        let result = StatementResult::from_rows(vec![row]);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.ids().unwrap(), vec![id]);

        let mut broken = Row::new();
        broken.insert("name".to_string(), json!("email"));
        assert!(StatementResult::from_rows(vec![broken]).ids().is_err());
    }

    #[test]
    fn test_affected_has_no_rows() {
        let result = StatementResult::affected(3);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 3);
        assert!(result.into_jobs().unwrap().is_empty());
    }
}
