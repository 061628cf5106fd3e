//! Engine configuration shared by every reconcile pass

use std::time::Duration;

use stratum_common::crd::BackupType;
use stratum_common::crypto::Encryptor;

/// Default image that runs exec actions and repository deletions
pub const DEFAULT_EXECUTOR_IMAGE: &str = "ghcr.io/stratum-dev/dp-tools:0.1.0";

/// Default service account for backup workloads
pub const DEFAULT_WORKER_SERVICE_ACCOUNT: &str = "stratum-dataprotection-worker";

/// Immutable settings for the backup engine, built once at startup
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Namespace the operator runs in; also searched for backup workloads
    pub controller_namespace: String,
    /// Service account for backup workloads when a target does not name one
    pub worker_service_account: String,
    /// Image for exec-action and deletion Jobs
    pub executor_image: String,
    /// activeDeadlineSeconds for Full and Selective backup Jobs
    pub job_deadline_full: Option<Duration>,
    /// activeDeadlineSeconds for Incremental backup Jobs
    pub job_deadline_incremental: Option<Duration>,
    /// First retry delay after a transient error
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// Encrypts system account passwords recorded on Backups; none recorded when unset
    pub encryptor: Option<Encryptor>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller_namespace: stratum_common::STRATUM_SYSTEM_NAMESPACE.to_string(),
            worker_service_account: DEFAULT_WORKER_SERVICE_ACCOUNT.to_string(),
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
            job_deadline_full: None,
            job_deadline_incremental: None,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            encryptor: None,
        }
    }
}

impl EngineConfig {
    /// Deadline for Job-backed actions of a backup type.
    ///
    /// Continuous backups run as StatefulSets and are never bounded.
    pub fn job_deadline(&self, backup_type: BackupType) -> Option<Duration> {
        match backup_type {
            BackupType::Full | BackupType::Selective => self.job_deadline_full,
            BackupType::Incremental => self.job_deadline_incremental,
            BackupType::Continuous => None,
        }
    }

    /// Retry delay for the given attempt (0-based): base doubled per attempt, capped
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 5)]
    #[case(1, 10)]
    #[case(2, 20)]
    #[case(5, 160)]
    #[case(6, 300)]
    #[case(40, 300)]
    fn test_backoff_doubles_and_caps(#[case] attempt: u32, #[case] secs: u64) {
        let config = EngineConfig::default();
        assert_eq!(config.backoff_for(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn test_job_deadline_by_type() {
        let config = EngineConfig {
            job_deadline_full: Some(Duration::from_secs(3600)),
            job_deadline_incremental: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        assert_eq!(
            config.job_deadline(BackupType::Selective),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            config.job_deadline(BackupType::Incremental),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.job_deadline(BackupType::Continuous), None);
    }
}
