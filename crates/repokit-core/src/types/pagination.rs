//! Pagination types for list queries.
//!
//! [`PagingInfo`] is the request shape bound from query strings. Its field
//! names are part of the wire contract and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::result::AppResult;

/// Default page size.
const DEFAULT_PAGE_SIZE: u32 = 10;

/// Paging, sorting and search parameters of a paged request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingInfo {
    /// Page number (1-based).
    #[serde(default = "default_page")]
    pub current_page: u32,
    /// Number of items per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Column to sort by; the composer's default column is used when unset.
    #[serde(default)]
    pub sort_column: Option<String>,
    /// Sort descending instead of ascending.
    #[serde(default)]
    pub sort_descending: bool,
    /// JSON-encoded object mapping column paths to search values.
    #[serde(default, rename = "search_term")]
    pub search_term_json: Option<String>,
    /// Free-text term matched against every searchable column.
    #[serde(default)]
    pub global_search: Option<String>,
    /// Total number of matching rows. Computed server-side.
    #[serde(default)]
    pub total_count: u64,
    /// Total number of pages. Computed server-side.
    #[serde(default)]
    pub total_pages: u64,
}

impl PagingInfo {
    /// Create a request for the given page window.
    pub fn new(current_page: u32, page_size: u32) -> Self {
        Self {
            current_page,
            page_size,
            ..Self::default()
        }
    }

    /// Set the sort column and direction.
    pub fn with_sort(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.sort_column = Some(column.into());
        self.sort_descending = descending;
        self
    }

    /// Set the global search term.
    pub fn with_global_search(mut self, term: impl Into<String>) -> Self {
        self.global_search = Some(term.into());
        self
    }

    /// Add one column search, re-encoding the search-term JSON.
    ///
    /// A malformed existing JSON document is replaced.
    pub fn with_search_term(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        let mut terms = self.search_terms().unwrap_or_default();
        terms.insert(column.into(), value.into());
        self.search_term_json = serde_json::to_string(&terms).ok();
        self
    }

    /// Parse the JSON-encoded column search map.
    ///
    /// A missing or blank document yields an empty map; malformed JSON is an
    /// argument error.
    pub fn search_terms(&self) -> AppResult<BTreeMap<String, String>> {
        match self.search_term_json.as_deref().map(str::trim) {
            None | Some("") => Ok(BTreeMap::new()),
            Some(json) => serde_json::from_str(json).map_err(|e| {
                AppError::argument(format!("search_term is not a JSON object of strings: {e}"))
            }),
        }
    }

    /// The global search term, if it is not blank.
    pub fn global_search_term(&self) -> Option<&str> {
        self.global_search
            .as_deref()
            .filter(|term| !term.trim().is_empty())
    }

    /// The sort column, if it is not blank.
    pub fn sort_column(&self) -> Option<&str> {
        self.sort_column
            .as_deref()
            .filter(|column| !column.trim().is_empty())
    }

    /// Reject a zero page number or page size.
    pub fn validate(&self) -> AppResult<()> {
        if self.current_page == 0 {
            return Err(AppError::argument("current_page must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(AppError::argument("page_size must be at least 1"));
        }
        Ok(())
    }

    /// Return a copy with the page size capped at `max_page_size`.
    pub fn clamped(&self, max_page_size: u32) -> Self {
        let mut info = self.clone();
        info.page_size = info.page_size.min(max_page_size.max(1));
        info
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        u64::from(self.current_page.saturating_sub(1)) * u64::from(self.page_size)
    }

    /// Number of rows to take.
    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }

    /// Calculate the number of pages for `total_count` rows.
    pub fn pages_for(&self, total_count: u64) -> u64 {
        total_pages(total_count, self.page_size)
    }

    /// Record the computed row count and the derived page count.
    pub fn set_total_count(&mut self, total_count: u64) {
        self.total_count = total_count;
        self.total_pages = self.pages_for(total_count);
    }
}

impl Default for PagingInfo {
    fn default() -> Self {
        Self {
            current_page: default_page(),
            page_size: default_page_size(),
            sort_column: None,
            sort_descending: false,
            search_term_json: None,
            global_search: None,
            total_count: 0,
            total_pages: 0,
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// Total number of items across all pages.
    pub total_count: u64,
    /// Current page number (1-based).
    pub current_page: u32,
    /// Number of items per page.
    pub page_size: u32,
}

impl<T> PagedResult<T> {
    /// Create a new paged result.
    pub fn new(items: Vec<T>, total_count: u64, current_page: u32, page_size: u32) -> Self {
        Self {
            items,
            total_count,
            current_page,
            page_size,
        }
    }

    /// Total number of pages.
    pub fn total_pages(&self) -> u64 {
        total_pages(self.total_count, self.page_size)
    }

    /// Whether there is a page after this one.
    pub fn has_next(&self) -> bool {
        u64::from(self.current_page) < self.total_pages()
    }

    /// Whether there is a page before this one.
    pub fn has_previous(&self) -> bool {
        self.current_page > 1
    }

    /// Convert into the legacy [`PagedList`] shape, echoing `request`.
    pub fn into_paged_list(self, request: &PagingInfo) -> PagedList<T> {
        let mut paging_info = request.clone();
        paging_info.current_page = self.current_page;
        paging_info.page_size = self.page_size;
        paging_info.set_total_count(self.total_count);
        PagedList {
            items: self.items,
            paging_info,
        }
    }
}

/// Legacy paged response: the items plus the echoed request with totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedList<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// The request parameters with `total_count`/`total_pages` filled in.
    pub paging_info: PagingInfo,
}

fn total_pages(total_count: u64, page_size: u32) -> u64 {
    if page_size == 0 {
        return 0;
    }
    total_count.div_ceil(u64::from(page_size))
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
