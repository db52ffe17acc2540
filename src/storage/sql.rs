// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for entity tables (MySQL, or SQLite for local runs).
//!
//! Generated statements for one flush run inside a single transaction and
//! stop at the first failing statement. Rows are read back positionally,
//! decoded per [`ColumnType`].
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver has no date/time or unsigned mappings, so:
//! 1. Temporal columns are selected as `CAST(col AS CHAR)` and parsed
//! 2. Unsigned values are bound as `i64` (values above `i64::MAX` are rejected)
//! 3. TEXT may come back as BLOB, so text decoding falls back to `Vec<u8>`

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::debug;

use super::traits::{ColumnType, ExecResult, RelationalStore, SqlStatement, StorageError};
use crate::resilience::retry::{retry, retry_if, RetryConfig};
use crate::value::Value;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

fn map_sqlx(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Database(db) => StorageError::Database {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_string(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StorageError::Decode(e.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

fn bind_value<'q>(query: AnyQuery<'q>, value: &Value) -> Result<AnyQuery<'q>, StorageError> {
    Ok(match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Uint(v) => query.bind(
            i64::try_from(*v)
                .map_err(|_| StorageError::Unsupported(format!("unsigned value {v} exceeds i64")))?,
        ),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Bool(v) => query.bind(*v),
        Value::String(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Time(v) => query.bind(v.format(DATETIME_FORMAT).to_string()),
        Value::Date(v) => query.bind(v.format(DATE_FORMAT).to_string()),
        Value::Set(v) => query.bind(v.join(",")),
        Value::Json(v) => query.bind(v.to_string()),
    })
}

fn decode_text(row: &AnyRow, idx: usize) -> Result<Option<String>, StorageError> {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => Ok(v),
        Err(_) => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .map_err(map_sqlx)?
            .map(|bytes| String::from_utf8(bytes).map_err(|e| StorageError::Decode(e.to_string())))
            .transpose(),
    }
}

fn decode_column(row: &AnyRow, idx: usize, column_type: ColumnType) -> Result<Value, StorageError> {
    let value = match column_type {
        ColumnType::UnsignedInt => row
            .try_get::<Option<i64>, _>(idx)
            .map_err(map_sqlx)?
            .map(|v| Value::Uint(v as u64)),
        ColumnType::SignedInt => row.try_get::<Option<i64>, _>(idx).map_err(map_sqlx)?.map(Value::Int),
        ColumnType::Float => row.try_get::<Option<f64>, _>(idx).map_err(map_sqlx)?.map(Value::Float),
        ColumnType::Bool => match row.try_get::<Option<bool>, _>(idx) {
            Ok(v) => v.map(Value::Bool),
            Err(_) => row
                .try_get::<Option<i64>, _>(idx)
                .map_err(map_sqlx)?
                .map(|v| Value::Bool(v != 0)),
        },
        ColumnType::Text => decode_text(row, idx)?.map(Value::String),
        ColumnType::Bytes => row.try_get::<Option<Vec<u8>>, _>(idx).map_err(map_sqlx)?.map(Value::Bytes),
        ColumnType::DateTime => decode_text(row, idx)?
            .map(|s| {
                NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT)
                    .map(Value::Time)
                    .map_err(|e| StorageError::Decode(format!("datetime '{s}': {e}")))
            })
            .transpose()?,
        ColumnType::Date => decode_text(row, idx)?
            .map(|s| {
                NaiveDate::parse_from_str(&s, DATE_FORMAT)
                    .map(Value::Date)
                    .map_err(|e| StorageError::Decode(format!("date '{s}': {e}")))
            })
            .transpose()?,
    };
    Ok(value.unwrap_or(Value::Null))
}

fn select_expression(name: &str, column_type: ColumnType) -> String {
    match column_type {
        ColumnType::DateTime | ColumnType::Date => format!("CAST(`{name}` AS CHAR)"),
        _ => format!("`{name}`"),
    }
}

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        if connection_string.starts_with("sqlite:") {
            store.enable_wal_mode().await?;
        }
        Ok(store)
    }

    /// Get a clone of the connection pool (schema setup in tests and tools).
    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn execute_once(&self, statements: &[SqlStatement]) -> Result<Vec<ExecResult>, TxFailure> {
        let mut tx = self.pool.begin().await.map_err(|e| TxFailure::BeforeCommit(map_sqlx(e)))?;
        let mut results = Vec::with_capacity(statements.len());

        for statement in statements {
            let (sql, params) = statement.to_sql();
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = bind_value(query, param).map_err(TxFailure::BeforeCommit)?;
            }
            // Dropping `tx` on error rolls back.
            let outcome = query
                .execute(&mut *tx)
                .await
                .map_err(|e| TxFailure::BeforeCommit(map_sqlx(e)))?;
            results.push(ExecResult {
                rows_affected: outcome.rows_affected(),
                last_insert_id: outcome.last_insert_id().and_then(|id| u64::try_from(id).ok()),
            });
        }

        tx.commit().await.map_err(|e| TxFailure::AtCommit(map_sqlx(e)))?;
        Ok(results)
    }
}

/// Where a transaction attempt failed. Once COMMIT was sent the outcome is
/// unknown, so the attempt is never repeated.
#[derive(Debug)]
enum TxFailure {
    BeforeCommit(StorageError),
    AtCommit(StorageError),
}

impl TxFailure {
    fn is_retryable(&self) -> bool {
        matches!(self, TxFailure::BeforeCommit(e) if e.is_transient())
    }

    fn into_storage(self) -> StorageError {
        match self {
            TxFailure::BeforeCommit(e) | TxFailure::AtCommit(e) => e,
        }
    }
}

impl std::fmt::Display for TxFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxFailure::BeforeCommit(e) => write!(f, "{e}"),
            TxFailure::AtCommit(e) => write!(f, "commit outcome unknown: {e}"),
        }
    }
}

async fn retry_transaction<F, Fut, T>(config: &RetryConfig, attempt: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TxFailure>>,
{
    retry_if("sql_execute", config, TxFailure::is_retryable, attempt)
        .await
        .map_err(TxFailure::into_storage)
}

#[async_trait]
impl RelationalStore for SqlStore {
    async fn execute(&self, statements: &[SqlStatement]) -> Result<Vec<ExecResult>, StorageError> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        let results = retry_transaction(&RetryConfig::query(), || self.execute_once(statements)).await?;
        debug!(statements = statements.len(), "Executed flush transaction");
        Ok(results)
    }

    async fn load_row(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        id: u64,
    ) -> Result<Option<Vec<Value>>, StorageError> {
        let select: Vec<String> = columns
            .iter()
            .map(|(name, column_type)| select_expression(name, *column_type))
            .collect();
        let sql = format!("SELECT {} FROM `{}` WHERE `ID` = ?", select.join(","), table);
        let id = i64::try_from(id).map_err(|_| StorageError::Unsupported(format!("id {id} exceeds i64")))?;

        let row = retry("sql_load_row", &RetryConfig::query(), || {
            let sql = sql.clone();
            async move {
                sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx)
            }
        })
        .await?;

        row.map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(idx, (_, column_type))| decode_column(&row, idx, *column_type))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
    }

    async fn search_ids(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
        limit: usize,
    ) -> Result<Vec<u64>, StorageError> {
        let sql = format!("SELECT `ID` FROM `{}` WHERE {} LIMIT {}", table, where_clause, limit);

        let rows = retry("sql_search_ids", &RetryConfig::query(), || {
            let sql = sql.clone();
            async move {
                let mut query = sqlx::query(&sql);
                for param in params {
                    query = bind_value(query, param)?;
                }
                query.fetch_all(&self.pool).await.map_err(map_sqlx)
            }
        })
        .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>(0)
                    .map(|id| id as u64)
                    .map_err(map_sqlx)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_temporal_columns_are_cast_to_text() {
        assert_eq!(select_expression("Born", ColumnType::Date), "CAST(`Born` AS CHAR)");
        assert_eq!(select_expression("Name", ColumnType::Text), "`Name`");
    }

    #[test]
    fn test_statement_rejections_keep_their_code() {
        let err = StorageError::Database {
            code: Some("1062".into()),
            message: "Duplicate entry '1' for key 'PRIMARY'".into(),
        };
        assert!(err.is_duplicate_key());
        assert!(!err.is_transient());
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
        }
    }

    #[tokio::test]
    async fn test_transient_failure_before_commit_is_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result = retry_transaction(&fast(), || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TxFailure::BeforeCommit(StorageError::Backend("pool timed out".into())))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lost_commit_reply_is_not_retried() {
        let counter = AtomicUsize::new(0);
        let attempts = &counter;
        let result: Result<(), _> = retry_transaction(&fast(), || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(TxFailure::AtCommit(StorageError::Backend("connection reset".into())))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
