//! Process-wide schema cache.
//!
//! Schemas are built lazily on first request and shared for the rest of
//! the process. Entries are keyed by [`TypeId`], so two entity types with
//! the same name never collide.

use std::any::TypeId;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;

use crate::entity::Reflect;
use crate::schema::EntitySchema;

static SCHEMAS: LazyLock<DashMap<TypeId, Arc<EntitySchema>>> = LazyLock::new(DashMap::new);

/// Return the memoised schema of `T`, describing it on first use.
pub fn schema_of<T: Reflect>() -> Arc<EntitySchema> {
    let type_id = TypeId::of::<T>();
    if let Some(schema) = SCHEMAS.get(&type_id) {
        return Arc::clone(schema.value());
    }

    // Built outside the map lock; a racing thread may build the same
    // schema, and the first insert wins.
    let schema = Arc::new(T::describe());
    let entry = SCHEMAS.entry(type_id).or_insert(schema);
    Arc::clone(entry.value())
}

/// Number of cached schemas.
pub fn cached_schema_count() -> usize {
    SCHEMAS.len()
}
