//! Backup controller error types
//!
//! Every failure a reconcile pass can hit is either fatal (the Backup moves
//! to `Failed` with the message as its failure reason) or transient (the pass
//! is retried with backoff and the status is left alone).

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] stratum_common::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A problem with the Backup or what it references that retrying cannot fix
    #[error("{0}")]
    Fatal(String),

    /// A dependency is not ready yet
    #[error("{0}")]
    Requeue(String),

    #[error("missing namespace on Backup")]
    MissingNamespace,
}

impl BackupError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn requeue(msg: impl Into<String>) -> Self {
        Self::Requeue(msg.into())
    }

    /// True if the Backup should move to `Failed` instead of being retried.
    ///
    /// Kubernetes API errors are always retried; a 409 Conflict means the
    /// Backup changed under us and the next pass sees the new version.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fatal(_) | Self::MissingNamespace => true,
            Self::Common(e) => !e.is_retryable(),
            Self::Kube(_) | Self::Serialization(_) | Self::Requeue(_) => false,
        }
    }

    /// True for optimistic-concurrency misses on status or metadata patches
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Kube(e) => stratum_common::error::is_conflict(e),
            Self::Common(stratum_common::Error::Kube { source }) => {
                stratum_common::error::is_conflict(source)
            }
            _ => false,
        }
    }

    /// Metrics label for this error
    pub fn error_type(&self) -> stratum_common::metrics::ErrorType {
        if self.is_fatal() {
            stratum_common::metrics::ErrorType::Fatal
        } else {
            stratum_common::metrics::ErrorType::Transient
        }
    }
}
