//! Storage boundaries and their backends.
//!
//! - [`RelationalStore`]: source of truth ([`sql::SqlStore`], [`memory_sql::InMemoryRelationalStore`])
//! - [`RemoteCache`]: shared entity cache ([`redis::RedisStore`], [`memory::InMemoryCache`])
//! - [`StreamStore`]: durable log for the event broker ([`redis::RedisStore`], [`memory_stream::InMemoryStreamStore`])

pub mod memory;
pub mod memory_sql;
pub mod memory_stream;
pub mod redis;
pub mod sql;
pub mod traits;

pub use traits::{
    ColumnType, ConsumerInfo, ExecResult, GroupInfo, Mutation, RelationalStore, RemoteCache,
    SqlStatement, StorageError, StreamEntry, StreamStore,
};
