//! PostgreSQL executor backed by a sqlx connection pool.

use super::{Executor, Param, Row, StatementResult};
use crate::{Result, config::DatabaseConfig, plans::Statement};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{
    Column, PgPool, Postgres, Row as _, TypeInfo,
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow},
    query::Query,
};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Runs statements on a shared PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    /// Opens a pool sized and tagged from `config`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)?
            .application_name(&config.application_name);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size={}, application_name={})",
            config.pool_size, config.application_name
        );
        Ok(Self { pool })
    }

    /// Wraps a pool owned by the caller.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: Vec<Param>,
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Uuid(value) => query.bind(value),
            Param::UuidArray(values) => query.bind(values),
            Param::Text(value) => query.bind(value),
            Param::Int(value) => query.bind(value),
            Param::Bool(value) => query.bind(value),
            Param::Json(value) => query.bind(value),
            Param::Timestamp(value) => query.bind(value),
        };
    }
    query
}

fn to_json<T: Serialize>(value: Option<T>) -> Result<Value> {
    Ok(match value {
        Some(value) => serde_json::to_value(value)?,
        None => Value::Null,
    })
}

/// Converts a row to a JSON object keyed by column name.
fn row_to_json(row: &PgRow) -> Result<Row> {
    let mut object = Row::new();

    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "UUID" => to_json(row.try_get::<Option<Uuid>, _>(index)?)?,
            "INT2" => to_json(row.try_get::<Option<i16>, _>(index)?)?,
            "INT4" => to_json(row.try_get::<Option<i32>, _>(index)?)?,
            "INT8" => to_json(row.try_get::<Option<i64>, _>(index)?)?,
            "FLOAT8" => to_json(row.try_get::<Option<f64>, _>(index)?)?,
            "BOOL" => to_json(row.try_get::<Option<bool>, _>(index)?)?,
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(index)?
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => to_json(row.try_get::<Option<DateTime<Utc>>, _>(index)?)?,
            "TIMESTAMP" => to_json(row.try_get::<Option<NaiveDateTime>, _>(index)?)?,
            // text, enum labels, and anything else with a textual wire form
            _ => to_json(row.try_get_unchecked::<Option<String>, _>(index)?)?,
        };
        object.insert(column.name().to_string(), value);
    }

    Ok(object)
}

#[async_trait]
impl Executor for PgExecutor {
    async fn execute(&self, statement: &Statement, params: Vec<Param>) -> Result<StatementResult> {
        debug!(
            "Executing {:?} with {} parameters",
            statement.command,
            params.len()
        );
        let query = bind_params(sqlx::query(&statement.text), params);

        if statement.command.returns_rows() {
            let rows = query.fetch_all(&self.pool).await?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
            Ok(StatementResult::from_rows(rows))
        } else {
            let result = query.execute(&self.pool).await?;
            Ok(StatementResult::affected(result.rows_affected()))
        }
    }

    async fn execute_batch(&self, statements: &[Statement]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for statement in statements {
            debug!("Executing {:?} in transaction", statement.command);
            sqlx::query(&statement.text).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
