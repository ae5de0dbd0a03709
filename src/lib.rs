//! # repokit
//!
//! A generic data-access layer: typed entities described at runtime,
//! declarative specifications, a dynamic query composer for paged search
//! and sort, a change-tracking generic repository and a unit of work with
//! explicit transactions.
//!
//! ```no_run
//! use repokit::prelude::*;
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Debug, Clone, Serialize, Deserialize)]
//! # struct Product { id: i32, name: String }
//! # impl Reflect for Product {
//! #     fn describe() -> EntitySchema {
//! #         EntitySchema::builder("Product").key("id", FieldKind::Int).field("name", FieldKind::Text).build()
//! #     }
//! # }
//! # async fn run() -> AppResult<()> {
//! let uow = UnitOfWork::memory(&MemoryDatabase::new());
//! let products = uow.repository::<Product>();
//! if let Some(product) = products.get_by_id(1).await? {
//!     product.write().name = "Renamed".into();
//! }
//! uow.save_changes().await?;
//! # Ok(())
//! # }
//! ```

pub mod telemetry;

pub use repokit_core as core;
pub use repokit_database as database;
pub use repokit_entity as entity;
pub use repokit_query as query;

/// The types most callers need.
pub mod prelude {
    pub use repokit_core::config::{AppConfig, DatabaseConfig, LoggingConfig, PagingConfig};
    pub use repokit_core::types::{PagedList, PagedResult, PagingInfo, SortDirection};
    pub use repokit_core::{AppError, AppResult, ErrorKind};
    pub use repokit_database::{
        CancellationToken, CustomRepository, DatabasePool, EntityState, MemoryDatabase,
        Repository, Session, Store, Tracked, UnitOfWork,
    };
    pub use repokit_entity::{
        AuditFields, Entity, EntityKey, EntitySchema, FieldKind, Record, Reflect, Value,
    };
    pub use repokit_query::{
        Assignment, Expr, PageOptions, Projection, Query, Specification, col,
    };
}
