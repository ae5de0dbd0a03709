//! Dynamic sorting by column name.

use repokit_core::AppResult;
use repokit_core::types::{SortDirection, SortField};
use tracing::debug;

use crate::path::resolve_field_path;
use crate::plan::QueryPlan;
use crate::projection::Projection;

/// Sort by `column`, or by `default_column` when none is given, then by
/// the key. Replaces any existing order.
pub fn apply_sorting(
    plan: QueryPlan,
    column: Option<&str>,
    descending: bool,
    default_column: &str,
) -> AppResult<QueryPlan> {
    let column = effective_column(column, default_column);
    let path = resolve_field_path(plan.schema(), column)?;
    Ok(order_by(plan, path.canonical, descending))
}

/// Sort a projected plan. `column` names a projected output first and an
/// entity field otherwise.
pub fn apply_projected_sorting(
    plan: QueryPlan,
    projection: &Projection,
    column: Option<&str>,
    descending: bool,
    default_column: &str,
) -> AppResult<QueryPlan> {
    let column = effective_column(column, default_column);
    let source = match projection.source_of(column) {
        Some(source) => source.to_string(),
        None => resolve_field_path(plan.schema(), column)?.canonical,
    };
    Ok(order_by(plan, source, descending))
}

fn effective_column<'a>(column: Option<&'a str>, default_column: &'a str) -> &'a str {
    column
        .filter(|column| !column.trim().is_empty())
        .unwrap_or(default_column)
}

fn order_by(mut plan: QueryPlan, path: String, descending: bool) -> QueryPlan {
    plan.order = vec![SortField::new(path, SortDirection::from_descending(descending))];
    plan.ensure_key_order();
    debug!(entity = plan.schema().name(), order = ?plan.order, "Resolved sort keys");
    plan
}
