//! Convenience result type alias for repokit.

use crate::error::AppError;

/// A specialized `Result` type for data-access operations.
///
/// Every crate in the workspace returns this so callers only ever match
/// on [`AppError`] and its [`ErrorKind`](crate::error::ErrorKind).
pub type AppResult<T> = Result<T, AppError>;
