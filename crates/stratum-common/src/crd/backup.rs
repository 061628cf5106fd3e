//! Backup Custom Resource Definition
//!
//! A Backup records one backup operation. The spec names the BackupPolicy and
//! method to use; the status is owned by the backup controller and carries the
//! resolved targets, per-action progress, lineage and expiration.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup_policy::{BackupMethod, BackupTarget, EncryptionConfig};
use super::types::ParameterPair;
use crate::Error;

/// What happens to repository data when the Backup is deleted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Delete stored files together with the Backup
    #[default]
    Delete,
    /// Keep stored files; the Backup stays until the policy changes
    Retain,
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "Delete"),
            Self::Retain => write!(f, "Retain"),
        }
    }
}

/// Phase of a Backup
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BackupPhase {
    /// Accepted, request not built yet
    #[default]
    New,
    /// Actions are executing
    Running,
    /// Every action completed
    Completed,
    /// An action failed or the request was invalid
    Failed,
    /// Cascading cleanup in progress
    Deleting,
}

impl BackupPhase {
    /// Phase name as stored in status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
        }
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a single action
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ActionPhase {
    /// Not started
    #[default]
    New,
    /// Workload created and not finished
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl ActionPhase {
    /// Completed and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Workload kind an action runs as
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ActionType {
    /// batch/v1 Job
    #[default]
    Job,
    /// apps/v1 StatefulSet (continuous backups)
    StatefulSet,
    /// VolumeSnapshots of the target volumes
    Snapshot,
}

/// Start and end of the data a backup covers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Earliest recoverable point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Latest recoverable point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Progress of one action against one target pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    /// Action name, unique per target pod
    pub name: String,

    /// Pod the action runs against
    #[serde(default)]
    pub target_pod_name: String,

    /// Current phase
    #[serde(default)]
    pub phase: ActionPhase,

    /// Workload kind
    #[serde(default)]
    pub action_type: ActionType,

    /// When the action was first observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// When the action finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// Why the action failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Size of the data the action wrote (e.g. "1.5Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<String>,

    /// Time range the action's data covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,

    /// Name of the Job, StatefulSet or snapshot group executing the action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_name: Option<String>,

    /// VolumeSnapshots created by a snapshot action
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshots: Vec<String>,
}

/// A target together with the pods resolved for it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatusTarget {
    /// The selection rule
    #[serde(flatten)]
    pub target: BackupTarget,

    /// Pods resolved for this target; frozen once recorded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_target_pods: Vec<String>,
}

/// Status of a Backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase; absent means New
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,

    /// Layout version of the stored data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_version: Option<String>,

    /// When the backup started running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    /// When every action completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// Completion minus start, rounded to seconds (e.g. "1m30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// When the backup may be garbage collected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    /// Path of the backup data inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Repository path used by kopia
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kopia_repo_path: Option<String>,

    /// Bound BackupRepo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_name: Option<String>,

    /// Repository PVC mounted by backup workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    /// Snapshot of the method used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_method: Option<BackupMethod>,

    /// Resolved single target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupStatusTarget>,

    /// Resolved targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BackupStatusTarget>,

    /// Per-action progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionStatus>,

    /// Previous backup in an incremental chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_name: Option<String>,

    /// Full backup at the root of an incremental chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup_name: Option<String>,

    /// Encryption applied to the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config: Option<EncryptionConfig>,

    /// Total size of the backup data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<String>,

    /// Time range the backup covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,

    /// Why the backup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl BackupStatus {
    /// Phase with an absent value read as New
    pub fn phase(&self) -> BackupPhase {
        self.phase.unwrap_or_default()
    }

    /// Resolved targets regardless of whether `target` or `targets` was used
    pub fn all_targets(&self) -> Vec<&BackupStatusTarget> {
        self.target.iter().chain(self.targets.iter()).collect()
    }
}

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.stratum.dev",
    version = "v1alpha1",
    kind = "Backup",
    derive = "PartialEq",
    plural = "backups",
    shortname = "dpb",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.backupMethod"}"#,
    printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".status.backupRepoName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Total-Size","type":"string","jsonPath":".status.totalSize"}"#,
    printcolumn = r#"{"name":"Duration","type":"string","jsonPath":".status.duration"}"#,
    printcolumn = r#"{"name":"Expiration","type":"string","jsonPath":".status.expiration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// BackupPolicy in the same namespace
    pub backup_policy_name: String,

    /// Method of that policy to run
    pub backup_method: String,

    /// What to do with stored data on deletion
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    /// How long to keep the backup (e.g. "7d", "1y2mo"); empty keeps it forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,

    /// Explicit parent for incremental backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_name: Option<String>,

    /// Parameters validated against the ActionSet schema
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterPair>,
}

impl Backup {
    /// Effective phase of this backup
    pub fn phase(&self) -> BackupPhase {
        self.status.as_ref().map(|s| s.phase()).unwrap_or_default()
    }
}

// =============================================================================
// Retention period
// =============================================================================

/// A parsed retention period such as `1y2mo3d`.
///
/// Years are 365 days and months 30 days, so the result is a fixed duration
/// independent of the calendar.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetentionPeriod {
    /// Years
    pub years: i64,
    /// Months
    pub months: i64,
    /// Days
    pub days: i64,
    /// Hours
    pub hours: i64,
    /// Minutes
    pub minutes: i64,
}

impl RetentionPeriod {
    /// Total duration of the period
    pub fn to_duration(&self) -> Duration {
        Duration::days(self.years * 365 + self.months * 30 + self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes)
    }

    /// True if every component is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl FromStr for RetentionPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim().to_lowercase();
        let mut period = RetentionPeriod::default();
        let mut rest = input.as_str();

        while !rest.is_empty() {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits == 0 {
                return Err(Error::validation(format!(
                    "invalid retention period {s:?}: expected a number at {rest:?}"
                )));
            }
            let value: i64 = rest[..digits].parse().map_err(|e| {
                Error::validation(format!("invalid retention period {s:?}: {e}"))
            })?;
            rest = &rest[digits..];

            let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
            let unit = &rest[..unit_len];
            rest = &rest[unit_len..];

            let slot = match unit {
                "y" => &mut period.years,
                "mo" => &mut period.months,
                "d" => &mut period.days,
                "h" => &mut period.hours,
                "m" => &mut period.minutes,
                other => {
                    return Err(Error::validation(format!(
                        "invalid retention period {s:?}: unknown unit {other:?}"
                    )))
                }
            };
            *slot += value;
        }

        Ok(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_backup_spec_roundtrip() {
        let spec: BackupSpec = serde_yaml::from_str(
            r#"
backupPolicyName: pg-cluster-backup-policy
backupMethod: pg-basebackup
deletionPolicy: Retain
retentionPeriod: 7d
parameters:
  - name: compression
    value: zstd
"#,
        )
        .unwrap();
        assert_eq!(spec.backup_policy_name, "pg-cluster-backup-policy");
        assert_eq!(spec.deletion_policy, DeletionPolicy::Retain);
        assert_eq!(spec.retention_period.as_deref(), Some("7d"));
        assert_eq!(spec.parameters[0].value, "zstd");
        assert!(spec.parent_backup_name.is_none());
    }

    #[test]
    fn test_deletion_policy_defaults_to_delete() {
        let spec: BackupSpec =
            serde_yaml::from_str("backupPolicyName: p\nbackupMethod: m").unwrap();
        assert_eq!(spec.deletion_policy, DeletionPolicy::Delete);
    }

    #[test]
    fn test_absent_phase_reads_as_new() {
        let backup = Backup::new("b", BackupSpec::default());
        assert_eq!(backup.phase(), BackupPhase::New);
        let status: BackupStatus = serde_yaml::from_str("path: /x").unwrap();
        assert_eq!(status.phase(), BackupPhase::New);
    }

    #[test]
    fn test_unknown_phase_fails_deserialization() {
        let parsed: Result<BackupStatus, _> = serde_yaml::from_str("phase: Paused");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_status_target_flattens_selector() {
        let status: BackupStatus = serde_yaml::from_str(
            r#"
phase: Running
target:
  name: primary
  podSelector:
    matchLabels:
      role: primary
  selectedTargetPods: [pg-0]
actions:
  - name: backupdata-pg-0
    targetPodName: pg-0
    phase: Running
"#,
        )
        .unwrap();
        let target = status.target.as_ref().unwrap();
        assert_eq!(target.target.name, "primary");
        assert_eq!(target.selected_target_pods, vec!["pg-0"]);
        assert_eq!(status.all_targets().len(), 1);
        assert_eq!(status.actions[0].action_type, ActionType::Job);
        assert!(!status.actions[0].phase.is_terminal());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(BackupPhase::New.to_string(), "New");
        assert_eq!(BackupPhase::Deleting.to_string(), "Deleting");
        assert_eq!(ActionPhase::Failed.to_string(), "Failed");
        assert_eq!(DeletionPolicy::Retain.to_string(), "Retain");
    }

    #[rstest]
    #[case("7d", Duration::days(7))]
    #[case("12h", Duration::hours(12))]
    #[case("30m", Duration::minutes(30))]
    #[case("1y", Duration::days(365))]
    #[case("1y2mo", Duration::days(425))]
    #[case("1d12h", Duration::hours(36))]
    #[case("2MO", Duration::days(60))]
    fn test_retention_period_parses(#[case] input: &str, #[case] expected: Duration) {
        let period: RetentionPeriod = input.parse().unwrap();
        assert_eq!(period.to_duration(), expected);
    }

    #[rstest]
    #[case("7")]
    #[case("d")]
    #[case("3w")]
    #[case("1d-2h")]
    fn test_retention_period_rejects(#[case] input: &str) {
        assert!(input.parse::<RetentionPeriod>().is_err());
    }

    #[test]
    fn test_empty_retention_period_is_zero() {
        assert!("".parse::<RetentionPeriod>().unwrap().is_zero());
    }
}
