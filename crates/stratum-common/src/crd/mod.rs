//! Custom Resource Definitions for Stratum data protection
//!
//! This module contains all CRD definitions used by the backup controller.

mod action_set;
mod backup;
mod backup_policy;
mod backup_repo;
mod backup_schedule;
mod types;

pub use action_set::{
    ActionSet, ActionSetSpec, ActionSpec, BackupActionSpec, ExecActionSpec, JobActionSpec,
    ParameterKind, ParameterProperty, ParametersSchema,
};
pub use backup::{
    ActionPhase, ActionStatus, ActionType, Backup, BackupPhase, BackupSpec, BackupStatus,
    BackupStatusTarget, DeletionPolicy, RetentionPeriod, TimeRange,
};
pub use backup_policy::{
    BackupMethod, BackupPolicy, BackupPolicyPhase, BackupPolicySpec, BackupPolicyStatus,
    BackupTarget, EncryptionConfig, PodSelectionStrategy, PodSelector, TargetVolumeInfo,
};
pub use backup_repo::{AccessMethod, BackupRepo, BackupRepoPhase, BackupRepoSpec, BackupRepoStatus};
pub use backup_schedule::{
    BackupSchedule, BackupSchedulePhase, BackupScheduleSpec, BackupScheduleStatus, SchedulePolicy,
};
pub use types::{BackupType, EnvVar, LabelSelector, ParameterPair, SecretKeyRef};
