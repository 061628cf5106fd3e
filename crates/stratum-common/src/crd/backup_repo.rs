//! BackupRepo Custom Resource Definition
//!
//! A BackupRepo is a storage location backups write into. The repo
//! controller (outside this crate) provisions a PVC per namespace for
//! `Mount` access or a tool-config Secret for `Tool` access and reports them
//! in status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How backup workloads reach the repository
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMethod {
    /// Mount a PersistentVolumeClaim
    #[default]
    Mount,
    /// Use a CLI tool configured from a Secret
    Tool,
}

/// Phase of a BackupRepo
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupRepoPhase {
    /// Connectivity being checked
    #[default]
    PreChecking,
    /// Usable
    Ready,
    /// Misconfigured or unreachable
    Failed,
    /// Being removed
    Deleting,
}

impl std::fmt::Display for BackupRepoPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreChecking => write!(f, "PreChecking"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Status of a BackupRepo
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRepoStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BackupRepoPhase,

    /// PVC name provisioned in each namespace that uses the repo
    #[serde(default, rename = "backupPVCName", skip_serializing_if = "Option::is_none")]
    pub backup_pvc_name: Option<String>,

    /// Secret holding the tool configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config_secret_name: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Specification for a BackupRepo
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.stratum.dev",
    version = "v1alpha1",
    kind = "BackupRepo",
    plural = "backuprepos",
    shortname = "repo",
    status = "BackupRepoStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Storage-Provider","type":"string","jsonPath":".spec.storageProviderRef"}"#,
    printcolumn = r#"{"name":"Access-Method","type":"string","jsonPath":".spec.accessMethod"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupRepoSpec {
    /// Storage provider backing the repo
    pub storage_provider_ref: String,

    /// Access method
    #[serde(default)]
    pub access_method: AccessMethod,

    /// Prefix under which every backup path is placed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl BackupRepo {
    /// Phase, PreChecking when status is absent
    pub fn phase(&self) -> BackupRepoPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// True when the repo carries the default-repo annotation
    pub fn is_default(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(crate::ANNOTATION_DEFAULT_REPO))
            .is_some_and(|v| v == "true")
    }

    /// True once the access artifacts backup workloads need exist
    pub fn is_prepared(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        match self.spec.access_method {
            AccessMethod::Mount => status.backup_pvc_name.as_deref().is_some_and(|s| !s.is_empty()),
            AccessMethod::Tool => status
                .tool_config_secret_name
                .as_deref()
                .is_some_and(|s| !s.is_empty()),
        }
    }
}
