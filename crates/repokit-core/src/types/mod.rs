//! Core type definitions shared by the query and database crates.

pub mod pagination;
pub mod sorting;

pub use pagination::{PagedList, PagedResult, PagingInfo};
pub use sorting::{SortDirection, SortField};
