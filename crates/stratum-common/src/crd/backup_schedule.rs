//! BackupSchedule Custom Resource Definition
//!
//! A BackupSchedule creates Backups on cron schedules. It is the only
//! legitimate creator of Continuous backups.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One scheduled method
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePolicy {
    /// Method of the policy to run
    pub backup_method: String,

    /// Whether the schedule is active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Cron expression (e.g. "0 2 * * *")
    pub cron_expression: String,

    /// Retention applied to created backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,
}

impl SchedulePolicy {
    /// Disabled unless explicitly enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// Phase of a BackupSchedule
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupSchedulePhase {
    /// Not reconciled yet
    #[default]
    InProgress,
    /// Schedules are active
    Available,
    /// Misconfigured
    Failed,
}

impl std::fmt::Display for BackupSchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "InProgress"),
            Self::Available => write!(f, "Available"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a BackupSchedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BackupSchedulePhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Specification for a BackupSchedule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.stratum.dev",
    version = "v1alpha1",
    kind = "BackupSchedule",
    plural = "backupschedules",
    shortname = "bs",
    namespaced,
    status = "BackupScheduleStatus",
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// BackupPolicy the schedules run against
    pub backup_policy_name: String,

    /// Scheduled methods
    #[serde(default)]
    pub schedules: Vec<SchedulePolicy>,
}

impl BackupSchedule {
    /// True when the schedule reports Available
    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == BackupSchedulePhase::Available)
    }

    /// Schedule entry for a method
    pub fn schedule_for(&self, method: &str) -> Option<&SchedulePolicy> {
        self.spec.schedules.iter().find(|s| s.backup_method == method)
    }
}
