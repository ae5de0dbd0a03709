//! The store boundary.
//!
//! A [`Store`] executes resolved [`QueryPlan`]s and applies batches of row
//! changes. Each unit of work owns one store instance; its transaction
//! slot is private to that unit of work.

mod memory;
mod postgres;

pub use memory::{MemoryDatabase, MemoryStore};
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;

use repokit_core::{AppError, AppResult};
use repokit_entity::{EntityKey, EntitySchema, Record, Value};
use repokit_query::{Aggregate, Assignment, QueryPlan};

/// One row change produced by the change tracker.
#[derive(Debug, Clone)]
pub enum Change {
    /// Insert a new row with the scalar members of `record`.
    Insert {
        /// Entity schema.
        schema: Arc<EntitySchema>,
        /// Scalar members of the new row.
        record: Record,
    },
    /// Overwrite the given members of the row with `key`.
    Update {
        /// Entity schema.
        schema: Arc<EntitySchema>,
        /// Row key.
        key: EntityKey,
        /// Changed non-key members.
        values: Record,
    },
    /// Delete the row with `key`.
    Delete {
        /// Entity schema.
        schema: Arc<EntitySchema>,
        /// Row key.
        key: EntityKey,
    },
}

impl Change {
    /// Schema of the changed row.
    pub fn schema(&self) -> &EntitySchema {
        match self {
            Self::Insert { schema, .. } | Self::Update { schema, .. } | Self::Delete { schema, .. } => {
                schema
            }
        }
    }

    /// Short verb for logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// A queryable, transactional row store.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Rows of the plan. Entity rows carry their scalar members plus the
    /// included relations as nested records and lists; projected rows are
    /// keyed by output name.
    async fn fetch(&self, plan: &QueryPlan) -> AppResult<Vec<Record>>;

    /// Number of rows matching the plan's filter.
    async fn count(&self, plan: &QueryPlan) -> AppResult<u64>;

    /// An aggregate over one field of the filtered rows. Max and min of
    /// no rows are null; sum and average of no rows are zero.
    async fn aggregate(&self, plan: &QueryPlan, function: Aggregate, field: &str) -> AppResult<Value>;

    /// Apply all changes atomically. Returns the number of affected rows.
    async fn apply(&self, changes: &[Change]) -> AppResult<u64>;

    /// Delete the plan's rows without loading them.
    async fn delete_where(&self, plan: &QueryPlan) -> AppResult<u64>;

    /// Update the plan's rows without loading them.
    async fn update_where(&self, plan: &QueryPlan, assignments: &[Assignment]) -> AppResult<u64>;

    /// Start a transaction.
    async fn begin(&self) -> AppResult<()>;

    /// Commit the active transaction. The transaction is released even
    /// when the commit fails.
    async fn commit(&self) -> AppResult<()>;

    /// Roll back the active transaction.
    async fn rollback(&self) -> AppResult<()>;

    /// Whether a transaction is active.
    fn in_transaction(&self) -> bool;
}

pub(crate) fn missing_row(schema: &EntitySchema, key: &EntityKey) -> AppError {
    AppError::store(format!(
        "No row with key {key} in table {}",
        schema.table()
    ))
}
