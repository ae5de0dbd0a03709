//! # repokit-entity
//!
//! The runtime type-introspection model used by the query composer and
//! the repositories. Entity types describe themselves once through
//! [`Reflect::describe`]; the resulting [`EntitySchema`] is memoised per
//! type and drives field lookup, search, sorting, capability probes and
//! the conversion between typed structs and dynamic [`Record`]s.

pub mod capability;
pub mod entity;
pub mod registry;
pub mod schema;
pub mod value;

pub use capability::{Auditable, SoftDeletable};
pub use entity::{Entity, EntityKey, Reflect};
pub use registry::schema_of;
pub use schema::{
    AuditFields, EntitySchema, EntitySchemaBuilder, FieldDescriptor, FieldKind, Member,
    RelationDescriptor, RelationKind,
};
pub use value::{Record, Value, record_to_json};
