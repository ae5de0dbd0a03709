//! The dynamic query composer.
//!
//! Pure functions from a [`QueryPlan`] and paging descriptors to a new
//! plan. The paged pipeline runs in a fixed order:
//!
//! 1. tracking mode and includes (already part of the incoming plan),
//! 2. global search,
//! 3. per-column search,
//! 4. sort by the requested or default column, key as tie-breaker,
//! 5. count on the unwindowed plan, then the page window.

mod column;
mod page;
mod search;
mod sort;

pub use column::apply_column_search;
pub use page::page_window;
pub use search::{apply_global_search, apply_projected_global_search};
pub use sort::{apply_projected_sorting, apply_sorting};

use repokit_core::config::PagingConfig;
use repokit_core::types::PagingInfo;
use repokit_core::{AppError, AppResult};

use crate::plan::QueryPlan;

/// Knobs of the paged pipeline.
#[derive(Debug, Clone)]
pub struct PageOptions {
    /// Sort column used when the request names none.
    pub default_sort_column: String,
    /// For projected pages: run global search over the projected columns
    /// (`true`) or over the entity's own fields (`false`).
    pub search_projection: bool,
    /// Cap applied to the requested page size.
    pub max_page_size: Option<u32>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            default_sort_column: "Id".to_string(),
            search_projection: true,
            max_page_size: None,
        }
    }
}

impl From<&PagingConfig> for PageOptions {
    fn from(config: &PagingConfig) -> Self {
        Self {
            default_sort_column: config.default_sort_column.clone(),
            search_projection: true,
            max_page_size: Some(config.max_page_size),
        }
    }
}

/// The two plans of a paged request.
#[derive(Debug, Clone)]
pub struct PagedQuery {
    /// Filtered, unwindowed plan to count.
    pub count: QueryPlan,
    /// Filtered, sorted and windowed plan to materialise.
    pub page: QueryPlan,
    /// The effective request, page size capped.
    pub request: PagingInfo,
}

/// Compose a paged entity query.
pub fn compose_page(plan: QueryPlan, info: &PagingInfo, options: &PageOptions) -> AppResult<PagedQuery> {
    let request = effective_request(info, options);
    let window = page_window(&request)?;
    let terms = request.search_terms()?;

    let plan = apply_global_search(plan, request.global_search_term());
    let plan = apply_column_search(plan, &terms)?;
    let plan = apply_sorting(
        plan,
        request.sort_column(),
        request.sort_descending,
        &options.default_sort_column,
    )?;
    Ok(finish(plan, window, request))
}

/// Compose a paged projected query. The plan must carry a projection.
pub fn compose_projected_page(
    plan: QueryPlan,
    info: &PagingInfo,
    options: &PageOptions,
) -> AppResult<PagedQuery> {
    let request = effective_request(info, options);
    let window = page_window(&request)?;
    let terms = request.search_terms()?;
    let projection = plan
        .projection
        .clone()
        .ok_or_else(|| AppError::argument("A projected page needs a projection"))?;

    let mut plan = plan;
    if !options.search_projection {
        plan = apply_global_search(plan, request.global_search_term());
    }
    plan = apply_column_search(plan, &terms)?;
    if options.search_projection {
        plan = apply_projected_global_search(plan, &projection, request.global_search_term())?;
    }
    let plan = apply_projected_sorting(
        plan,
        &projection,
        request.sort_column(),
        request.sort_descending,
        &options.default_sort_column,
    )?;
    Ok(finish(plan, window, request))
}

fn effective_request(info: &PagingInfo, options: &PageOptions) -> PagingInfo {
    match options.max_page_size {
        Some(max) => info.clamped(max),
        None => info.clone(),
    }
}

fn finish(plan: QueryPlan, (skip, take): (u64, u64), request: PagingInfo) -> PagedQuery {
    let count = plan.for_count();
    let page = plan.with_window(Some(skip), Some(take));
    PagedQuery {
        count,
        page,
        request,
    }
}
