//! Integration tests for repokit, run against the in-memory store.

mod helpers;
mod paging_test;
mod search_test;
mod soft_delete_test;
mod tracking_test;
mod transaction_test;
