// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The relational store rejected a statement (constraint violation,
    /// bad column, lock timeout). Never retried.
    #[error("Database error{}: {message}", code.as_ref().map(|c| format!(" {c}")).unwrap_or_default())]
    Database {
        code: Option<String>,
        message: String,
    },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Failed to decode stored data: {0}")]
    Decode(String),
    #[error("Unsupported by this backend: {0}")]
    Unsupported(String),
}

impl StorageError {
    /// Connectivity and transport failures that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }

    #[must_use]
    pub fn is_database(&self) -> bool {
        matches!(self, StorageError::Database { .. })
    }

    /// MySQL 1062 / SQLite 2067 / Postgres 23505.
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(
            self,
            StorageError::Database { code: Some(code), .. }
                if code == "1062" || code == "2067" || code == "23505"
        )
    }
}

/// How a column is stored, which decides how a row is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    UnsignedInt,
    SignedInt,
    Float,
    Bool,
    Text,
    Bytes,
    DateTime,
    Date,
}

/// A generated mutation against one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Update {
        id: u64,
        set: Vec<(String, Value)>,
    },
    Delete {
        id: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub table: String,
    pub mutation: Mutation,
}

/// Outcome of one executed statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// The relational pool. Only generated statements are accepted for writes.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Execute statements in order inside one transaction. Stops at the
    /// first failing statement and rolls back.
    async fn execute(&self, statements: &[SqlStatement]) -> Result<Vec<ExecResult>, StorageError>;

    /// Load one row by identity, decoded per column type.
    async fn load_row(
        &self,
        table: &str,
        columns: &[(String, ColumnType)],
        id: u64,
    ) -> Result<Option<Vec<Value>>, StorageError>;

    /// Identities matching a query template's rewritten WHERE clause.
    async fn search_ids(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
        limit: usize,
    ) -> Result<Vec<u64>, StorageError>;
}

/// A remote key/value cache shared between processes.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;
    async fn del(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Default implementation falls back to sequential gets.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }
}

/// One stored stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, Vec<u8>)>,
}

impl StreamEntry {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub pending: u64,
    pub last_delivered_id: String,
    pub consumers: Vec<ConsumerInfo>,
}

/// Append-only log with consumer groups (Redis Streams semantics).
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append entries in order, returning their ids.
    async fn append(
        &self,
        stream: &str,
        entries: Vec<Vec<(String, Vec<u8>)>>,
    ) -> Result<Vec<String>, StorageError>;

    /// Create `group` reading from the start of the stream. Existing
    /// groups are left untouched.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StorageError>;

    /// Entries delivered to `consumer` but not yet acknowledged.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    /// Entries never delivered to the group. With `block`, waits up to
    /// that long when none are available.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError>;

    async fn delete_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<(), StorageError>;

    async fn len(&self, stream: &str) -> Result<u64, StorageError>;

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, StorageError>;
}
