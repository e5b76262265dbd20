//! Error types for control-plane calls and provisioning.
//!
//! `ApiError` is what a backend returns for a single control-plane call. It is
//! classified so adapters can treat "not found" and "already exists" as the
//! idempotent outcomes they are, and let everything else propagate.
//! `ProvisionError` is what adapters, the orchestrator and cleanup report.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Error from a single control-plane call.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// The kind of error
    pub kind: ApiErrorKind,
    /// Operation that failed (e.g. `create_role`)
    pub operation: String,
    /// Error message from the control plane
    pub message: String,
}

impl ApiError {
    pub fn new(
        kind: ApiErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// The named resource does not exist.
    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, operation, message)
    }

    /// A resource with the same name already exists.
    pub fn already_exists(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::AlreadyExists, operation, message)
    }

    /// The request conflicts with current resource state.
    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Conflict, operation, message)
    }

    /// The request was rejected as malformed.
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Validation, operation, message)
    }

    /// Rate limited by the control plane.
    pub fn throttled(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Throttled, operation, message)
    }

    /// Any other service-side failure.
    pub fn service(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Service, operation, message)
    }

    /// Connection failed before the control plane answered.
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Network, operation, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ApiErrorKind::AlreadyExists
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }

    /// Check if this error is transient.
    ///
    /// Transient errors are not retried here beyond what the client library
    /// already does; the classification is reported so operators know a
    /// plain re-run is likely to succeed.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind, self.operation, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Classification of control-plane errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Resource does not exist
    NotFound,
    /// Resource with this name exists already
    AlreadyExists,
    /// Request conflicts with current state (e.g. overlapping policy)
    Conflict,
    /// Rate limited - transient
    Throttled,
    /// Malformed request - permanent
    Validation,
    /// Caller lacks permission - permanent
    AccessDenied,
    /// Server-side failure - transient
    Service,
    /// Connection failure - transient
    Network,
}

impl ApiErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiErrorKind::Throttled | ApiErrorKind::Service | ApiErrorKind::Network
        )
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiErrorKind::NotFound => "not found",
            ApiErrorKind::AlreadyExists => "already exists",
            ApiErrorKind::Conflict => "conflict",
            ApiErrorKind::Throttled => "throttled",
            ApiErrorKind::Validation => "validation error",
            ApiErrorKind::AccessDenied => "access denied",
            ApiErrorKind::Service => "service error",
            ApiErrorKind::Network => "network error",
        };
        write!(f, "{}", s)
    }
}

/// Extension for control-plane results where "not found" is an expected answer.
pub trait ApiResultExt<T> {
    /// Map a `NotFound` error to `Ok(None)`.
    fn optional(self) -> Result<Option<T>, ApiError>;
}

impl<T> ApiResultExt<T> for Result<T, ApiError> {
    fn optional(self) -> Result<Option<T>, ApiError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Error raised while provisioning or tearing down resources.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("{resource} '{id}' entered terminal state {status}{}", reason_suffix(.reason))]
    FailedState {
        resource: String,
        id: String,
        status: String,
        reason: Option<String>,
    },

    #[error("timed out after {elapsed:?} waiting for {resource} '{id}' to reach {target}")]
    Timeout {
        resource: String,
        id: String,
        target: String,
        elapsed: Duration,
    },

    #[error("missing precondition: {0}")]
    Precondition(String),

    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("deployment package error: {0}")]
    Package(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) => format!(": {}", r),
        None => String::new(),
    }
}

impl ProvisionError {
    /// Whether a plain re-run has a reasonable chance of getting past this error.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Api(e) => e.is_transient(),
            ProvisionError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_maps_only_not_found() {
        let missing: Result<u32, ApiError> = Err(ApiError::not_found("get_role", "no role"));
        assert!(missing.optional().unwrap().is_none());

        let present: Result<u32, ApiError> = Ok(7);
        assert_eq!(present.optional().unwrap(), Some(7));

        let denied: Result<u32, ApiError> = Err(ApiError::new(
            ApiErrorKind::AccessDenied,
            "get_role",
            "nope",
        ));
        assert!(denied.optional().is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(ApiError::throttled("list_agents", "slow down").is_transient());
        assert!(ApiError::network("list_agents", "reset").is_transient());
        assert!(!ApiError::validation("create_agent", "bad").is_transient());
        assert!(!ApiError::conflict("create_policy", "dup").is_transient());
    }

    #[test]
    fn failed_state_message_includes_reason() {
        let err = ProvisionError::FailedState {
            resource: "ingestion job".to_string(),
            id: "job-1".to_string(),
            status: "FAILED".to_string(),
            reason: Some("bad document".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "ingestion job 'job-1' entered terminal state FAILED: bad document"
        );
    }
}
