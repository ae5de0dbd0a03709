//! Paging defaults.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::result::AppResult;
use crate::types::PagingInfo;

/// Defaults used when a paged request leaves values unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    /// Page size used when a request does not specify one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    /// Upper bound applied by [`PagingInfo::clamped`](crate::types::PagingInfo::clamped).
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    /// Sort column used when a request does not name one.
    #[serde(default = "default_sort_column")]
    pub default_sort_column: String,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            default_sort_column: default_sort_column(),
        }
    }
}

impl PagingConfig {
    /// A request for `current_page` at the default page size.
    pub fn request(&self, current_page: u32) -> PagingInfo {
        PagingInfo::new(current_page, self.default_page_size)
    }

    /// Bind a JSON request body. A missing `page_size` takes the default
    /// page size; other missing members take the [`PagingInfo`] defaults.
    pub fn bind_request(&self, body: &str) -> AppResult<PagingInfo> {
        let mut value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| AppError::argument(format!("Malformed paging request: {e}")))?;
        if let Some(object) = value.as_object_mut() {
            object
                .entry("page_size")
                .or_insert_with(|| self.default_page_size.into());
        }
        serde_json::from_value(value)
            .map_err(|e| AppError::argument(format!("Malformed paging request: {e}")))
    }
}

fn default_page_size() -> u32 {
    10
}

fn default_max_page_size() -> u32 {
    100
}

fn default_sort_column() -> String {
    "Id".to_string()
}
