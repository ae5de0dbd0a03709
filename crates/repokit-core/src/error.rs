//! Unified error types for repokit.
//!
//! Every failure surfaced by the composer, the repositories, the unit of
//! work, or a store driver is an [`AppError`] carrying one [`ErrorKind`].
//! Driver-specific errors never leak: they are attached as the `source`
//! of a [`ErrorKind::StoreOperation`] error.

use std::fmt;
use thiserror::Error;

/// Error categories surfaced by the data-access layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Malformed input: unknown sort column, unresolvable property path,
    /// invalid paging window, malformed search-term JSON.
    Argument,
    /// Soft-delete or restore invoked on an entity type without the
    /// soft-delete capability.
    CapabilityMismatch,
    /// A query without projection requested a result type other than the
    /// entity type.
    ProjectionTypeMismatch,
    /// A get-or-throw lookup matched zero rows.
    NotFound,
    /// The underlying store rejected an operation.
    StoreOperation,
    /// An operation was invoked in the wrong transaction or tracking state.
    InvalidOperation,
    /// The cancellation signal fired before the store call completed.
    Cancelled,
    /// A configuration error occurred.
    Configuration,
    /// A serialization/deserialization error occurred.
    Serialization,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument => write!(f, "ARGUMENT"),
            Self::CapabilityMismatch => write!(f, "CAPABILITY_MISMATCH"),
            Self::ProjectionTypeMismatch => write!(f, "PROJECTION_TYPE_MISMATCH"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::StoreOperation => write!(f, "STORE_OPERATION"),
            Self::InvalidOperation => write!(f, "INVALID_OPERATION"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Serialization => write!(f, "SERIALIZATION"),
        }
    }
}

/// The unified error used throughout repokit.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    /// The category of error.
    pub kind: ErrorKind,
    /// A developer-facing error message.
    pub message: String,
    /// Optional underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new error with an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Argument, message)
    }

    /// Create a capability-mismatch error.
    pub fn capability_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapabilityMismatch, message)
    }

    /// Create a projection-type-mismatch error.
    pub fn projection_type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProjectionTypeMismatch, message)
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Create a store-operation error without a driver cause.
    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreOperation, message)
    }

    /// Create an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    /// Create a cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    /// Wrap this error as the cause of a [`ErrorKind::StoreOperation`]
    /// error. Errors that already are store errors or cancellations are
    /// returned unchanged.
    pub fn into_store_error(self, message: impl Into<String>) -> Self {
        match self.kind {
            ErrorKind::StoreOperation | ErrorKind::Cancelled => self,
            _ => Self::with_source(ErrorKind::StoreOperation, message, self),
        }
    }

    /// Whether this error has the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(
            ErrorKind::Serialization,
            format!("JSON serialization error: {err}"),
            err,
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_source(
            ErrorKind::Configuration,
            format!("Configuration error: {err}"),
            err,
        )
    }
}
