//! Global search: one free-text term against every searchable column.

use chrono::NaiveDate;
use repokit_core::AppResult;
use repokit_entity::{FieldDescriptor, FieldKind, Value};

use crate::expr::{CompareOp, Expr};
use crate::plan::QueryPlan;
use crate::projection::Projection;

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d"];

/// Match `term` case-insensitively against every top-level scalar field
/// of the plan's entity. A row matches when any field matches. A blank
/// term leaves the plan unchanged.
pub fn apply_global_search(mut plan: QueryPlan, term: Option<&str>) -> QueryPlan {
    let Some(term) = term.filter(|term| !term.trim().is_empty()) else {
        return plan;
    };
    let predicate = Expr::any_of(
        plan.schema()
            .searchable_fields()
            .filter_map(|field| field_predicate(&field.name, field, term)),
    );
    push_search(&mut plan, predicate);
    plan
}

/// Global search over the source fields of the projected columns.
pub fn apply_projected_global_search(
    mut plan: QueryPlan,
    projection: &Projection,
    term: Option<&str>,
) -> AppResult<QueryPlan> {
    let Some(term) = term.filter(|term| !term.trim().is_empty()) else {
        return Ok(plan);
    };
    let columns = projection.source_fields(plan.schema())?;
    let predicate = Expr::any_of(
        columns
            .iter()
            .filter_map(|(column, field)| field_predicate(&column.source, field, term)),
    );
    push_search(&mut plan, predicate);
    Ok(plan)
}

fn push_search(plan: &mut QueryPlan, predicate: Expr) {
    // No searchable column means the term constrains nothing.
    if predicate != Expr::never() {
        tracing::trace!(entity = plan.schema().name(), "Applied global search");
        plan.filters.push(predicate);
    }
}

/// The per-field test of a global search, or `None` when the field can
/// never match the term.
fn field_predicate(path: &str, field: &FieldDescriptor, term: &str) -> Option<Expr> {
    let needle = term.to_lowercase();
    match field.kind {
        FieldKind::Text => Some(Expr::all([
            Expr::NotNull(path.to_string()),
            Expr::Contains {
                path: path.to_string(),
                needle,
                stringify: false,
            },
        ])),
        FieldKind::Date => parse_date(term).map(|date| Expr::Compare {
            path: path.to_string(),
            op: CompareOp::Eq,
            value: Value::Date(date),
        }),
        _ => {
            let contains = Expr::Contains {
                path: path.to_string(),
                needle,
                stringify: true,
            };
            if field.nullable {
                Some(Expr::all([Expr::NotNull(path.to_string()), contains]))
            } else {
                Some(contains)
            }
        }
    }
}

fn parse_date(term: &str) -> Option<NaiveDate> {
    let term = term.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(term, format).ok())
}
