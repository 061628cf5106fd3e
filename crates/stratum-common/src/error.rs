//! Error types shared across the Stratum crates
//!
//! Errors are structured with fields to aid debugging in production.
//! Validation errors name the resource they concern so that log lines and
//! status messages point at the right object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shared Stratum operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "telemetry", "create_client")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation errors are not retryable (require a spec fix).
    /// Kubernetes errors are retryable unless the API server rejected the request
    /// with a 4xx, except 409 Conflict which is an optimistic-concurrency miss.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Returns true if a kube error is worth retrying as-is
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => true,
        kube::Error::Api(ae) => !(400..500).contains(&ae.code),
        _ => true,
    }
}

/// Returns true if a kube error is a 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Returns true if a kube error is a 409 Conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    /// Story: a user creates a Backup with an unparsable retention period and
    /// the error names the backup so the fix is obvious.
    #[test]
    fn story_validation_errors_name_the_resource() {
        let err = Error::validation_for("nightly-1", "invalid retention period \"7w\"");
        assert_eq!(
            err.to_string(),
            "validation error for nightly-1: invalid retention period \"7w\""
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflict_is_retryable_but_other_client_errors_are_not() {
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
        assert!(!Error::from(api_error(404)).is_retryable());
        assert!(Error::from(api_error(503)).is_retryable());
    }

    #[test]
    fn not_found_and_conflict_helpers() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(500)));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        assert!(err.is_retryable());
    }
}
