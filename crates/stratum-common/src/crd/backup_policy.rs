//! BackupPolicy Custom Resource Definition
//!
//! A BackupPolicy binds a database cluster's pods to the BackupMethods that
//! can back them up and to the BackupRepo where the data lands.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{EnvVar, LabelSelector, SecretKeyRef};

/// How pods are picked from those matching a target's selector
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodSelectionStrategy {
    /// One matching pod, the first by name
    #[default]
    Any,
    /// Every matching pod
    All,
}

/// Selector for the pods a backup runs against
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    /// Label selector matched against pods in the backup namespace
    #[serde(default, flatten)]
    pub label_selector: LabelSelector,

    /// Selector used when the primary one matches nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_label_selector: Option<LabelSelector>,

    /// Selection strategy
    #[serde(default)]
    pub strategy: PodSelectionStrategy,

    /// Reuse the parent backup's selected pods for incremental chains
    #[serde(default)]
    pub use_parent_selected_pods: bool,
}

/// A set of pods a backup runs against
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    /// Target name, unique within a policy when `targets` is used
    #[serde(default)]
    pub name: String,

    /// Pod selection rule
    #[serde(default)]
    pub pod_selector: PodSelector,

    /// Service account backup workloads run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Container inside the target pod that exec actions run in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// Volumes of the target pod a method snapshots or mounts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetVolumeInfo {
    /// Pod volume names backed by PersistentVolumeClaims
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    /// Mount paths for those volumes inside backup workloads
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_mounts: BTreeMap<String, String>,
}

/// Encryption applied to data written to the repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// Cipher name (e.g. "AES-256-CFB")
    pub algorithm: String,

    /// Secret key holding the passphrase
    pub pass_phrase_secret_key_ref: SecretKeyRef,
}

/// A named strategy for producing a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethod {
    /// Method name referenced by `Backup.spec.backupMethod`
    pub name: String,

    /// Take volume snapshots instead of running an ActionSet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,

    /// ActionSet that performs the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_set_name: Option<String>,

    /// Full method whose backups an incremental method chains onto
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatible_method: Option<String>,

    /// Method-level target, overrides the policy target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,

    /// Method-level targets, overrides the policy targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BackupTarget>,

    /// Volumes to snapshot or mount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_volumes: Option<TargetVolumeInfo>,

    /// Extra environment for backup workloads
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

impl BackupMethod {
    /// True when the method takes volume snapshots
    pub fn is_snapshot(&self) -> bool {
        self.snapshot_volumes.unwrap_or(false)
    }

    /// ActionSet name, treating an empty string as unset
    pub fn action_set(&self) -> Option<&str> {
        self.action_set_name.as_deref().filter(|s| !s.is_empty())
    }
}

/// Phase of a BackupPolicy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupPolicyPhase {
    /// Policy can be used by backups
    #[default]
    Available,
    /// Policy is misconfigured
    Unavailable,
}

impl std::fmt::Display for BackupPolicyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "Available"),
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Status of a BackupPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicyStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BackupPolicyPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a BackupPolicy
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.stratum.dev",
    version = "v1alpha1",
    kind = "BackupPolicy",
    plural = "backuppolicies",
    shortname = "bp",
    namespaced,
    status = "BackupPolicyStatus",
    printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".spec.backupRepoName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    /// BackupRepo to store data in (omit to use the default repo)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_name: Option<String>,

    /// Prefix for backup paths inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Store data through kopia, which keeps its own repository path
    #[serde(default)]
    pub use_kopia: bool,

    /// Encryption for repository data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_config: Option<EncryptionConfig>,

    /// Default target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,

    /// Default targets (sharded clusters)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BackupTarget>,

    /// Methods backups may reference
    #[serde(default)]
    pub backup_methods: Vec<BackupMethod>,
}

impl BackupPolicySpec {
    /// Look up a method by name
    pub fn method(&self, name: &str) -> Option<&BackupMethod> {
        self.backup_methods.iter().find(|m| m.name == name)
    }
}

impl BackupPolicy {
    /// True unless the status reports Unavailable
    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase != BackupPolicyPhase::Unavailable)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_spec(yaml: &str) -> BackupPolicySpec {
        serde_yaml::from_str(yaml).expect("parse spec")
    }

    #[test]
    fn test_backup_policy_roundtrip() {
        let spec = parse_spec(
            r#"
backupRepoName: s3-repo
pathPrefix: /pg-cluster/postgresql
encryptionConfig:
  algorithm: AES-256-CFB
  passPhraseSecretKeyRef:
    name: dp-encryption
    key: passphrase
target:
  podSelector:
    matchLabels:
      app.kubernetes.io/instance: pg-cluster
      role: primary
    strategy: Any
backupMethods:
  - name: pg-basebackup
    snapshotVolumes: false
    actionSetName: pg-basebackup
    targetVolumes:
      volumes: [data]
  - name: volume-snapshot
    snapshotVolumes: true
    targetVolumes:
      volumes: [data]
"#,
        );

        assert_eq!(spec.backup_repo_name.as_deref(), Some("s3-repo"));
        let target = spec.target.as_ref().unwrap();
        assert_eq!(
            target.pod_selector.label_selector.match_labels.get("role"),
            Some(&"primary".to_string())
        );
        assert_eq!(target.pod_selector.strategy, PodSelectionStrategy::Any);
        assert_eq!(
            spec.encryption_config.as_ref().unwrap().pass_phrase_secret_key_ref.key,
            "passphrase"
        );

        let basebackup = spec.method("pg-basebackup").unwrap();
        assert!(!basebackup.is_snapshot());
        assert_eq!(basebackup.action_set(), Some("pg-basebackup"));
        assert!(spec.method("volume-snapshot").unwrap().is_snapshot());
        assert!(spec.method("missing").is_none());
    }

    #[test]
    fn test_empty_action_set_name_is_unset() {
        let method = BackupMethod {
            name: "m".to_string(),
            action_set_name: Some(String::new()),
            ..Default::default()
        };
        assert!(method.action_set().is_none());
        assert!(!method.is_snapshot());
    }

    #[test]
    fn test_policy_availability() {
        let mut policy = BackupPolicy::new("bp", BackupPolicySpec::default());
        assert!(policy.is_available());
        policy.status = Some(BackupPolicyStatus {
            phase: BackupPolicyPhase::Unavailable,
            ..Default::default()
        });
        assert!(!policy.is_available());
    }

    #[test]
    fn test_unknown_policy_phase_is_rejected() {
        let parsed: Result<BackupPolicyStatus, _> = serde_yaml::from_str("phase: Broken");
        assert!(parsed.is_err());
    }
}
