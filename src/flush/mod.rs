//! Diff & SQL Builder and the Flush Engine.
//!
//! - [`diff`]: entity state → [`EntitySqlFlush`] records
//! - [`sql`]: records → generated [`SqlStatement`](crate::storage::SqlStatement)s
//! - [`executor`]: [`Flusher`], immediate and lazy execution

pub mod diff;
pub mod executor;
pub mod sql;

use thiserror::Error;

pub use diff::{build_flush, EntitySqlFlush, FlushAction};
pub use executor::Flusher;

use crate::broker::BrokerError;
use crate::registry::BindError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum FlushError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("mysql pool '{pool}' rejected flush: {source}")]
    Storage {
        pool: String,
        #[source]
        source: StorageError,
    },
    #[error("failed to queue lazy flush: {0}")]
    Broker(#[from] BrokerError),
    #[error("entity {0} is not registered")]
    UnknownEntity(String),
    #[error("mysql pool '{0}' has no connection")]
    MissingPool(String),
    #[error("lazy insert of {entity} requires an identity or uuid")]
    LazyInsertWithoutId { entity: String },
}

impl FlushError {
    /// The relational store rejected a statement (as opposed to being
    /// unreachable).
    #[must_use]
    pub fn is_database(&self) -> bool {
        matches!(self, FlushError::Storage { source, .. } if source.is_database())
    }

    #[must_use]
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            FlushError::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}
