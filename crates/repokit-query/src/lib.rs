//! # repokit-query
//!
//! Everything needed to describe a query over an entity type without
//! touching a store:
//!
//! - [`Expr`]: the predicate tree, built with [`col`] and resolved
//!   against an entity schema before execution.
//! - [`Query`] and [`QueryPlan`]: typed builder and the untyped plan that
//!   stores consume.
//! - [`Specification`]: reusable, declarative query descriptors.
//! - [`composer`]: global search, column search, dynamic sort and paging.
//! - [`sql`]: rendering of plans into PostgreSQL statements.

pub mod composer;
pub mod eval;
pub mod expr;
pub mod path;
pub mod plan;
pub mod projection;
pub mod specification;
pub mod sql;

pub use composer::{PageOptions, PagedQuery};
pub use eval::RelationResolver;
pub use expr::{Column, CompareOp, Expr, col};
pub use path::{FieldPath, RelationPath};
pub use plan::{Aggregate, Assignment, Query, QueryPlan};
pub use projection::Projection;
pub use specification::Specification;
pub use sql::{SqlParam, SqlStatement};
