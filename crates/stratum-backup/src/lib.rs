//! Backup lifecycle reconciliation for Stratum data protection
//!
//! This crate drives `Backup` resources through their phases:
//!
//! - **controller**: phase dispatch, error classification and retry backoff
//! - **request**: resolves policy, method, ActionSet, repo and targets into a
//!   per-pass working copy
//! - **lineage**: parent/base resolution for incremental backups
//! - **target**: selects the pods each target resolves to
//! - **annotations**: cluster snapshot and encrypted accounts recorded at start
//! - **status**: merges action results into the Backup status and aggregates them
//! - **action**: runs Job, exec, StatefulSet and snapshot actions
//! - **snapshot**: typed VolumeSnapshot access
//! - **deletion**: cascading cleanup guarded by the finalizer

pub mod action;
pub mod annotations;
pub mod client;
pub mod config;
pub mod controller;
pub mod deletion;
pub mod error;
pub mod lineage;
pub mod request;
pub mod snapshot;
pub mod status;
pub mod target;

pub use config::EngineConfig;
pub use controller::{error_policy, reconcile, Context};
pub use error::BackupError;

/// Field manager for server-side and merge patches issued by this controller
pub const FIELD_MANAGER: &str = "stratum-backup-controller";

/// Requeue interval while actions are still running (30 seconds)
const REQUEUE_RUNNING_SECS: u64 = 30;

/// Requeue interval right after a phase transition (1 second)
const REQUEUE_IMMEDIATE_SECS: u64 = 1;

/// Requeue interval while waiting for execution pods to terminate (5 seconds)
const REQUEUE_DELETE_WAIT_SECS: u64 = 5;

/// Prefix a log collector puts on the failure reasons it writes
pub const LOG_COLLECTOR_MARKER: &str = "[LogCollector]";

/// Version of the on-repository backup layout written by this controller
pub const BACKUP_FORMAT_VERSION: &str = "0.1.0";
