//! Dot-separated member paths.
//!
//! A field path crosses zero or more to-one references and ends at a
//! scalar field (`category.name`). A relation path names a chain of
//! relations (`lines.product`). Both resolve member names
//! case-insensitively and report their canonical spelling.

use std::sync::Arc;

use repokit_core::{AppError, AppResult};
use repokit_entity::{EntitySchema, FieldDescriptor, Member, RelationDescriptor, RelationKind};

/// A resolved path to a scalar field.
#[derive(Debug, Clone)]
pub struct FieldPath {
    /// To-one references crossed before the field.
    pub references: Vec<RelationDescriptor>,
    /// The leaf field.
    pub field: FieldDescriptor,
    /// Canonical dotted spelling.
    pub canonical: String,
}

impl FieldPath {
    /// Whether the path stays on the root entity.
    pub fn is_local(&self) -> bool {
        self.references.is_empty()
    }
}

/// A resolved chain of relations.
#[derive(Debug, Clone)]
pub struct RelationPath {
    /// Every relation crossed, in order.
    pub relations: Vec<RelationDescriptor>,
    /// Canonical dotted spelling.
    pub canonical: String,
}

impl RelationPath {
    /// The last relation of the chain.
    pub fn last(&self) -> Option<&RelationDescriptor> {
        self.relations.last()
    }

    /// Schema of the entity the chain ends at.
    pub fn target(&self) -> Option<Arc<EntitySchema>> {
        self.last().map(RelationDescriptor::target)
    }
}

/// Split a dotted path, rejecting empty segments.
pub fn split_path(path: &str) -> AppResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(AppError::argument(format!("Invalid property path '{path}'")));
    }
    Ok(segments)
}

/// Resolve a path ending at a scalar field, crossing only to-one references.
pub fn resolve_field_path(schema: &EntitySchema, path: &str) -> AppResult<FieldPath> {
    let segments = split_path(path)?;
    let Some((leaf, hops)) = segments.split_last() else {
        return Err(AppError::argument(format!("Invalid property path '{path}'")));
    };

    let mut references = Vec::with_capacity(hops.len());
    let mut canonical = Vec::with_capacity(segments.len());
    let mut scope: Option<Arc<EntitySchema>> = None;

    for segment in hops {
        let current = scope.as_deref().unwrap_or(schema);
        let relation = match current.require_member(segment)? {
            Member::Relation(relation) if relation.kind == RelationKind::Reference => {
                relation.clone()
            }
            Member::Relation(relation) => {
                return Err(AppError::argument(format!(
                    "Property '{}' on type '{}' is a collection and needs an any-predicate",
                    relation.name,
                    current.name()
                )));
            }
            Member::Field(field) => {
                return Err(AppError::argument(format!(
                    "Property '{}' on type '{}' is not a navigation",
                    field.name,
                    current.name()
                )));
            }
        };
        canonical.push(relation.name.clone());
        let next = relation.target();
        references.push(relation);
        scope = Some(next);
    }

    let current = scope.as_deref().unwrap_or(schema);
    let field = match current.require_member(leaf)? {
        Member::Field(field) => field.clone(),
        Member::Relation(relation) => {
            return Err(AppError::argument(format!(
                "Property '{}' on type '{}' is a navigation, not a value",
                relation.name,
                current.name()
            )));
        }
    };
    canonical.push(field.name.clone());

    Ok(FieldPath {
        references,
        field,
        canonical: canonical.join("."),
    })
}

/// Resolve a chain of relations. With `collections` false every relation
/// must be a to-one reference except the last, which must be a collection
/// (the shape of an any-predicate); with `collections` true any mix is
/// accepted (the shape of an include).
pub fn resolve_relation_path(
    schema: &EntitySchema,
    path: &str,
    collections: bool,
) -> AppResult<RelationPath> {
    let segments = split_path(path)?;
    let mut relations = Vec::with_capacity(segments.len());
    let mut scope: Option<Arc<EntitySchema>> = None;

    for (index, segment) in segments.iter().enumerate() {
        let current = scope.as_deref().unwrap_or(schema);
        let relation = match current.require_member(segment)? {
            Member::Relation(relation) => relation.clone(),
            Member::Field(field) => {
                return Err(AppError::argument(format!(
                    "Property '{}' on type '{}' is not a navigation",
                    field.name,
                    current.name()
                )));
            }
        };

        if !collections {
            let is_last = index + 1 == segments.len();
            if is_last != relation.is_collection() {
                return Err(AppError::argument(format!(
                    "Path '{path}' must cross references and end at a collection"
                )));
            }
        }

        let next = relation.target();
        relations.push(relation);
        scope = Some(next);
    }

    let canonical = relations
        .iter()
        .map(|relation| relation.name.as_str())
        .collect::<Vec<_>>()
        .join(".");
    Ok(RelationPath {
        relations,
        canonical,
    })
}
