//! Shared handles to materialised entities.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use repokit_core::{AppError, AppResult};
use repokit_entity::{Entity, Record, Value};

/// A handle to one entity instance.
///
/// Clones share the instance. Handles returned by tracked queries are
/// registered with the session, which compares their state with the
/// loaded snapshot on save; writing through [`Tracked::write`] is all it
/// takes to persist a change. Do not hold a guard across a call into the
/// session.
pub struct Tracked<T> {
    inner: Arc<RwLock<T>>,
}

impl<T: Entity> Tracked<T> {
    pub(crate) fn new(entity: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    /// Borrow the entity.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Borrow the entity mutably.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// A copy of the current state.
    pub fn get(&self) -> T {
        self.inner.read().clone()
    }

    /// Replace the whole entity.
    pub fn set(&self, entity: T) {
        *self.inner.write() = entity;
    }

    /// Write one member by name through the record form.
    pub fn set_field(&self, name: &str, value: Value) -> AppResult<()> {
        let schema = T::schema();
        let field = schema.field(name).ok_or_else(|| {
            AppError::argument(format!(
                "Property '{name}' does not exist on type {}",
                schema.name()
            ))
        })?;
        let mut record = self.record()?;
        record.insert(field.name.clone(), value.coerce(field.kind)?);
        self.overwrite(&record)
    }

    /// Whether both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn record(&self) -> AppResult<Record> {
        self.inner.read().to_record()
    }

    pub(crate) fn overwrite(&self, record: &Record) -> AppResult<()> {
        let entity = T::from_record(record)?;
        *self.inner.write() = entity;
        Ok(())
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tracked").field(&*self.inner.read()).finish()
    }
}

/// Type-erased access the change tracker needs to a handle.
pub(crate) trait TrackedEntry: Send + Sync {
    fn record(&self) -> AppResult<Record>;
    fn overwrite(&self, record: &Record) -> AppResult<()>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> TrackedEntry for Tracked<T> {
    fn record(&self) -> AppResult<Record> {
        Tracked::record(self)
    }

    fn overwrite(&self, record: &Record) -> AppResult<()> {
        Tracked::overwrite(self, record)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Product;

    #[test]
    fn test_set_field_coerces_by_kind() {
        let product = Tracked::new(Product::sample(1, "Rake", "2.00"));
        product.set_field("Price", Value::from("3.5")).unwrap();
        assert_eq!(product.read().price.to_string(), "3.5");
        assert!(product.set_field("colour", Value::from("red")).is_err());

        let alias = product.clone();
        alias.write().name = "Leaf rake".into();
        assert_eq!(product.get().name, "Leaf rake");
        assert!(alias.ptr_eq(&product));
    }
}
