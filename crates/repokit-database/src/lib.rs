//! # repokit-database
//!
//! Stores, change tracking and the data-access facade:
//!
//! - [`Store`]: the execution boundary, with an in-memory implementation
//!   ([`MemoryStore`]) and a Postgres one ([`PgStore`]) over a
//!   [`DatabasePool`].
//! - [`Session`]: identity map and change tracker; [`Tracked`] handles are
//!   the entities it hands out.
//! - [`Repository`]: generic per-entity data access.
//! - [`UnitOfWork`]: one session, its repositories and its transaction.

pub mod connection;
pub mod repository;
pub mod session;
pub mod store;
pub mod tracked;
pub mod unit_of_work;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::DatabasePool;
pub use repository::Repository;
pub use session::{EntityState, Session};
pub use store::{Change, MemoryDatabase, MemoryStore, PgStore, Store};
pub use tracked::Tracked;
pub use unit_of_work::{CustomRepository, UnitOfWork};

pub use tokio_util::sync::CancellationToken;
