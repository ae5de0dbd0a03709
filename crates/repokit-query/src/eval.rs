//! In-process evaluation of resolved expressions.
//!
//! Navigation members are read from the record when they were loaded and
//! otherwise fetched through a [`RelationResolver`]. Null never satisfies a
//! comparison or containment test.

use std::cmp::Ordering;

use repokit_entity::{EntitySchema, Record, RelationDescriptor, Value};

use crate::expr::{CompareOp, Expr};

/// Looks up related rows for a record.
pub trait RelationResolver {
    /// The row referenced by a to-one relation of `record`.
    fn reference(
        &self,
        schema: &EntitySchema,
        record: &Record,
        relation: &RelationDescriptor,
    ) -> Option<Record>;

    /// The rows of a to-many relation of `record`.
    fn collection(
        &self,
        schema: &EntitySchema,
        record: &Record,
        relation: &RelationDescriptor,
    ) -> Vec<Record>;
}

/// A resolver for records whose navigation members are already loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedOnly;

impl RelationResolver for LoadedOnly {
    fn reference(&self, _: &EntitySchema, _: &Record, _: &RelationDescriptor) -> Option<Record> {
        None
    }

    fn collection(&self, _: &EntitySchema, _: &Record, _: &RelationDescriptor) -> Vec<Record> {
        Vec::new()
    }
}

/// Evaluate a resolved expression against one record of `schema`.
pub fn evaluate(
    expr: &Expr,
    schema: &EntitySchema,
    record: &Record,
    resolver: &dyn RelationResolver,
) -> bool {
    match expr {
        Expr::Const(value) => *value,
        Expr::Compare { path, op, value } => {
            let actual = read_path(schema, record, path, resolver);
            if actual.is_null() || value.is_null() {
                return false;
            }
            let ordering = actual.compare(value);
            match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::Ne => ordering != Ordering::Equal,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
            }
        }
        Expr::Contains { path, needle, .. } => read_path(schema, record, path, resolver)
            .to_search_text()
            .is_some_and(|text| text.contains(needle.as_str())),
        Expr::IsNull(path) => read_path(schema, record, path, resolver).is_null(),
        Expr::NotNull(path) => !read_path(schema, record, path, resolver).is_null(),
        Expr::In { path, values } => {
            let actual = read_path(schema, record, path, resolver);
            !actual.is_null()
                && values
                    .iter()
                    .any(|candidate| actual.compare(candidate) == Ordering::Equal)
        }
        Expr::And(items) => items
            .iter()
            .all(|item| evaluate(item, schema, record, resolver)),
        Expr::Or(items) => items
            .iter()
            .any(|item| evaluate(item, schema, record, resolver)),
        Expr::Not(inner) => !evaluate(inner, schema, record, resolver),
        Expr::Any {
            relation,
            predicate,
        } => collection_rows(schema, record, relation, resolver)
            .map(|(target, rows)| {
                rows.iter()
                    .any(|row| evaluate(predicate, &target, row, resolver))
            })
            .unwrap_or(false),
    }
}

/// Read the value at a canonical field path, crossing references.
/// Missing members and broken references read as null.
pub fn read_path(
    schema: &EntitySchema,
    record: &Record,
    path: &str,
    resolver: &dyn RelationResolver,
) -> Value {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((leaf, hops)) = segments.split_last() else {
        return Value::Null;
    };

    let mut owned_schema;
    let mut current_schema = schema;
    let mut owned_record;
    let mut current_record = record;

    for segment in hops {
        let Some(relation) = current_schema.relation(segment) else {
            return Value::Null;
        };
        let next = match current_record.get(&relation.name) {
            Some(Value::Record(loaded)) => Some(loaded.clone()),
            _ => resolver.reference(current_schema, current_record, relation),
        };
        let Some(next) = next else {
            return Value::Null;
        };
        owned_schema = relation.target();
        owned_record = next;
        current_schema = &owned_schema;
        current_record = &owned_record;
    }

    current_schema
        .field(leaf)
        .and_then(|field| current_record.get(&field.name))
        .cloned()
        .unwrap_or_default()
}

fn collection_rows(
    schema: &EntitySchema,
    record: &Record,
    path: &str,
    resolver: &dyn RelationResolver,
) -> Option<(std::sync::Arc<EntitySchema>, Vec<Record>)> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, hops) = segments.split_last()?;

    let mut owned_schema;
    let mut current_schema = schema;
    let mut owned_record;
    let mut current_record = record;

    for segment in hops {
        let relation = current_schema.relation(segment)?;
        let next = match current_record.get(&relation.name) {
            Some(Value::Record(loaded)) => loaded.clone(),
            _ => resolver.reference(current_schema, current_record, relation)?,
        };
        owned_schema = relation.target();
        owned_record = next;
        current_schema = &owned_schema;
        current_record = &owned_record;
    }

    let relation = current_schema.relation(last)?;
    let rows = match current_record.get(&relation.name) {
        Some(Value::List(loaded)) => loaded
            .iter()
            .filter_map(|item| item.as_record().cloned())
            .collect(),
        _ => resolver.collection(current_schema, current_record, relation),
    };
    Some((relation.target(), rows))
}
