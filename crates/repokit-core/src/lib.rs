//! # repokit-core
//!
//! Core crate for repokit. Contains the unified error taxonomy,
//! configuration schemas, and the paging/sorting wire types shared by
//! the query composer and the repositories.
//!
//! This crate has **no** internal dependencies on other repokit crates.

pub mod config;
pub mod error;
pub mod result;
pub mod types;

pub use error::{AppError, ErrorKind};
pub use result::AppResult;
