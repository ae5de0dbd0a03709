//! Entity traits and keys.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use repokit_core::{AppError, AppResult};

use crate::registry::schema_of;
use crate::schema::EntitySchema;
use crate::value::{Record, Value, record_to_json};

/// Runtime self-description of an entity type.
///
/// Implementations return the same schema on every call; it is built once
/// and cached through [`schema_of`].
pub trait Reflect: 'static {
    /// Describe the members, key and capabilities of this type.
    fn describe() -> EntitySchema;

    /// The cached schema of this type.
    fn schema() -> Arc<EntitySchema>
    where
        Self: Sized,
    {
        schema_of::<Self>()
    }
}

/// A persistable entity.
///
/// Implemented for every serde-capable [`Reflect`] type. Navigation members
/// should be `Option<_>`/`Vec<_>` with `#[serde(default)]`; they are only
/// populated when included.
pub trait Entity: Reflect + Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Convert to the dynamic record form.
    fn to_record(&self) -> AppResult<Record>;

    /// Rebuild an entity from its record form.
    fn from_record(record: &Record) -> AppResult<Self>;

    /// The key of this instance.
    fn key(&self) -> AppResult<EntityKey>;
}

impl<T> Entity for T
where
    T: Reflect + Serialize + DeserializeOwned + Clone + Send + Sync,
{
    fn to_record(&self) -> AppResult<Record> {
        let json = serde_json::to_value(self)?;
        T::schema().record_from_json(json)
    }

    fn from_record(record: &Record) -> AppResult<Self> {
        serde_json::from_value(record_to_json(record)).map_err(|e| {
            AppError::with_source(
                repokit_core::ErrorKind::Serialization,
                format!("Record cannot be read as {}: {e}", T::schema().name()),
                e,
            )
        })
    }

    fn key(&self) -> AppResult<EntityKey> {
        T::schema().key_of(&self.to_record()?)
    }
}

/// An entity key. Composite keys keep their schema key order.
#[derive(Debug, Clone)]
pub struct EntityKey(Vec<Value>);

impl EntityKey {
    /// A single-column key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// A key made of several values, in key order.
    pub fn composite(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The key values.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Normalise the key values to the key field kinds of `schema`.
    pub fn coerce(self, schema: &EntitySchema) -> AppResult<Self> {
        let fields = schema.key_fields();
        if fields.len() != self.0.len() {
            return Err(AppError::argument(format!(
                "Entity {} has a {}-part key, got {} value(s)",
                schema.name(),
                fields.len(),
                self.0.len()
            )));
        }
        self.0
            .into_iter()
            .zip(fields)
            .map(|(value, field)| value.coerce(field.kind))
            .collect::<AppResult<Vec<_>>>()
            .map(Self)
    }

    /// Stable string form used by identity maps.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|value| format!("{}:{value}", value.type_name()))
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}
