use serde::Serialize;

use crate::entities::lot::JobKind;
use crate::repositories::RepositoryError;

/// Unified error type for the qualification engine.
///
/// Fatal conditions abort the running operation; insufficient stock is the
/// deliberate exception and is normally collected as lot-level warnings
/// instead of being raised (the variant exists for callers that treat a
/// shortage as terminal).
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("External dependency failed during {job}: {message}")]
    ExternalDependency { job: JobKind, message: String },

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Repository error: {0}")]
    Repository(
        #[from]
        #[serde(skip)]
        RepositoryError,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::ValidationError(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        ServiceError::PreconditionFailed(message.into())
    }

    pub fn computation(message: impl Into<String>) -> Self {
        ServiceError::ComputationError(message.into())
    }

    pub fn external(job: JobKind, message: impl Into<String>) -> Self {
        ServiceError::ExternalDependency {
            job,
            message: message.into(),
        }
    }

    /// Stable category label used in logs and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationError(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::PreconditionFailed(_) => "precondition",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::ComputationError(_) => "computation",
            Self::ExternalDependency { .. } => "external_dependency",
            Self::EventError(_) => "event",
            Self::InternalError(_) => "internal",
            Self::Repository(_) => "repository",
        }
    }

    /// True for failures a `retry` of the same transition can plausibly fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExternalDependency { .. } | Self::EventError(_) | Self::Repository(_)
        )
    }
}
