//! Per-column search from a `{ path: value }` map.

use std::collections::BTreeMap;

use repokit_core::{AppError, AppResult};
use repokit_entity::{EntitySchema, FieldDescriptor, FieldKind, Member, Value};
use uuid::Uuid;

use crate::expr::{CompareOp, Expr};
use crate::path::split_path;
use crate::plan::QueryPlan;

/// AND one predicate per non-blank entry onto the plan.
///
/// Paths are dotted and case-insensitive. References are crossed
/// directly; a collection on the way turns the rest of the path into an
/// "any element matches" test. Uuid columns match exactly, and a value
/// that does not parse as a uuid matches nothing. Every other column
/// matches when its text contains the value, ignoring case.
pub fn apply_column_search(mut plan: QueryPlan, terms: &BTreeMap<String, String>) -> AppResult<QueryPlan> {
    for (column, value) in terms {
        if value.trim().is_empty() {
            continue;
        }
        let segments = split_path(column)?;
        let predicate = compile(plan.schema(), &segments, value, "")?;
        plan.filters.push(predicate);
    }
    Ok(plan)
}

fn compile(schema: &EntitySchema, segments: &[&str], value: &str, prefix: &str) -> AppResult<Expr> {
    let Some((head, rest)) = segments.split_first() else {
        return Err(AppError::argument("Empty search column"));
    };
    match schema.require_member(head)? {
        Member::Field(field) if rest.is_empty() => {
            Ok(leaf_predicate(format!("{prefix}{}", field.name), field, value))
        }
        Member::Field(field) => Err(AppError::argument(format!(
            "Property '{}' on type {} has no member '{}'",
            field.name,
            schema.name(),
            rest[0]
        ))),
        Member::Relation(relation) if rest.is_empty() => Err(AppError::argument(format!(
            "Property '{}' on type {} is a navigation; search one of its members",
            relation.name,
            schema.name()
        ))),
        Member::Relation(relation) if relation.is_collection() => {
            let target = relation.target();
            let predicate = compile(&target, rest, value, "")?;
            Ok(Expr::Any {
                relation: format!("{prefix}{}", relation.name),
                predicate: Box::new(predicate),
            })
        }
        Member::Relation(relation) => {
            let target = relation.target();
            compile(&target, rest, value, &format!("{prefix}{}.", relation.name))
        }
    }
}

fn leaf_predicate(path: String, field: &FieldDescriptor, value: &str) -> Expr {
    match field.kind {
        FieldKind::Uuid => match Uuid::parse_str(value.trim()) {
            Ok(id) => Expr::Compare {
                path,
                op: CompareOp::Eq,
                value: Value::Uuid(id),
            },
            Err(_) => Expr::never(),
        },
        kind => Expr::Contains {
            path,
            needle: value.to_lowercase(),
            stringify: kind != FieldKind::Text,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::fixtures::Product;
    use crate::plan::Query;
    use repokit_core::ErrorKind;

    fn search(pairs: &[(&str, &str)]) -> AppResult<QueryPlan> {
        let terms = pairs
            .iter()
            .map(|(column, value)| (column.to_string(), value.to_string()))
            .collect();
        apply_column_search(Query::<Product>::new().into_plan()?, &terms)
    }

    #[test]
    fn test_scalar_and_reference_columns() {
        let plan = search(&[("Name", "RAKE"), ("category.NAME", "garden"), ("price", " ")]).unwrap();
        assert_eq!(
            plan.filters,
            vec![
                Expr::Contains {
                    path: "name".into(),
                    needle: "rake".into(),
                    stringify: false,
                },
                Expr::Contains {
                    path: "category.name".into(),
                    needle: "garden".into(),
                    stringify: false,
                },
            ]
        );
    }

    #[test]
    fn test_collection_column_becomes_any() {
        let plan = search(&[("tags.label", "red")]).unwrap();
        assert_eq!(
            plan.filters,
            vec![Expr::Any {
                relation: "tags".into(),
                predicate: Box::new(Expr::Contains {
                    path: "label".into(),
                    needle: "red".into(),
                    stringify: false,
                }),
            }]
        );
    }

    #[test]
    fn test_uuid_column_matches_exactly() {
        let id = Uuid::new_v4();
        let plan = search(&[("code", id.to_string().as_str())]).unwrap();
        assert_eq!(
            plan.filters,
            vec![Expr::Compare {
                path: "code".into(),
                op: CompareOp::Eq,
                value: Value::Uuid(id),
            }]
        );
        let plan = search(&[("tags.external_id", "not-a-uuid")]).unwrap();
        assert!(matches!(
            &plan.filters[0],
            Expr::Any { predicate, .. } if **predicate == Expr::never()
        ));
    }

    #[test]
    fn test_bad_columns_are_rejected() {
        for column in ["nope", "name.first", "category", "tags"] {
            let err = search(&[(column, "x")]).unwrap_err();
            assert!(err.is(ErrorKind::Argument), "{column} should be rejected");
        }
    }
}
