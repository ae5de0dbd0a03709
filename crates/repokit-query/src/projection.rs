//! Declarative projections.
//!
//! A projection maps output names to source field paths. Stores evaluate
//! it, so a projected query never materialises whole entities. Projected
//! rows deserialize into any `DeserializeOwned` shape whose field names
//! match the output names.

use repokit_core::{AppError, AppResult};
use repokit_entity::{EntitySchema, FieldDescriptor};

use crate::path::resolve_field_path;

/// One output column of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    /// Name of the member in the projected row.
    pub output: String,
    /// Source field path on the entity.
    pub source: String,
}

/// Output name to source path mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<ProjectedColumn>,
}

impl Projection {
    /// An empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a field under its own name.
    pub fn field(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.column(name.clone(), name)
    }

    /// Copy the field at `source` under `output`.
    pub fn column(mut self, output: impl Into<String>, source: impl Into<String>) -> Self {
        self.columns.push(ProjectedColumn {
            output: output.into(),
            source: source.into(),
        });
        self
    }

    /// The columns in declaration order.
    pub fn columns(&self) -> &[ProjectedColumn] {
        &self.columns
    }

    /// Source path of the output column `name`, matched case-insensitively.
    pub fn source_of(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|column| column.output.eq_ignore_ascii_case(name))
            .map(|column| column.source.as_str())
    }

    /// Canonicalise the source paths against `schema`.
    pub fn resolve(&self, schema: &EntitySchema) -> AppResult<Projection> {
        if self.columns.is_empty() {
            return Err(AppError::argument("A projection needs at least one column"));
        }
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let path = resolve_field_path(schema, &column.source)?;
                Ok(ProjectedColumn {
                    output: column.output.clone(),
                    source: path.canonical,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Projection { columns })
    }

    /// The source field descriptor of every column, for search and decoding.
    pub fn source_fields(&self, schema: &EntitySchema) -> AppResult<Vec<(ProjectedColumn, FieldDescriptor)>> {
        self.columns
            .iter()
            .map(|column| {
                let path = resolve_field_path(schema, &column.source)?;
                Ok((column.clone(), path.field))
            })
            .collect()
    }
}
