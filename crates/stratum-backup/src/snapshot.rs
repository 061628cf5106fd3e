//! Volume snapshot resources
//!
//! Typed struct for the CSI `VolumeSnapshot` resource, applied through
//! `DynamicObject` like every other third-party type the operator touches.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratum_common::kube_utils::{label_selector, HasApiResource, ObjectMeta};

use crate::error::BackupError;
use crate::FIELD_MANAGER;

/// CSI VolumeSnapshot resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    /// API version
    #[serde(default = "VolumeSnapshot::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "VolumeSnapshot::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Snapshot specification
    pub spec: VolumeSnapshotSpec,
    /// Snapshot status, set by the snapshot controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotStatus>,
}

impl HasApiResource for VolumeSnapshot {
    const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
    const KIND: &'static str = "VolumeSnapshot";
}

impl VolumeSnapshot {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }
    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Snapshot of a PersistentVolumeClaim
    pub fn for_claim(
        name: impl Into<String>,
        namespace: impl Into<String>,
        claim_name: impl Into<String>,
        labels: &BTreeMap<String, String>,
    ) -> Self {
        let metadata = ObjectMeta::new(name, namespace).with_labels(labels);
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(claim_name.into()),
                },
                volume_snapshot_class_name: None,
            },
            status: None,
        }
    }

    /// True once the snapshot can be restored from
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Error reported by the snapshot controller
    pub fn error_message(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .and_then(|e| e.message.as_deref())
    }

    /// Size of the data a restore would produce
    pub fn restore_size(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.restore_size.as_deref())
    }
}

/// VolumeSnapshot spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Volume to snapshot
    pub source: VolumeSnapshotSource,
    /// Snapshot class; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

/// Snapshot source
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    /// Claim to snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

/// VolumeSnapshot status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Snapshot is usable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Restore size as a quantity string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
    /// Last error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

/// VolumeSnapshot error
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeSnapshotError {
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Creates and deletes volume snapshots keyed by Backup identity labels
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Create the snapshot if it does not exist and return its current state
    async fn ensure_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot, BackupError>;

    /// Delete every snapshot carrying all the given labels, returning how many were deleted
    async fn delete_snapshots(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize, BackupError>;
}

/// CSI snapshot provider over the Kubernetes API
pub struct KubeSnapshotProvider {
    client: Client,
}

impl KubeSnapshotProvider {
    /// Create a provider using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &VolumeSnapshot::api_resource(),
        )
    }
}

#[async_trait]
impl SnapshotProvider for KubeSnapshotProvider {
    async fn ensure_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot, BackupError> {
        let name = &snapshot.metadata.name;
        let api = self.api(&snapshot.metadata.namespace);

        let current = match api.get_opt(name).await? {
            Some(existing) => existing,
            None => {
                // Status is owned by the snapshot controller
                let mut desired = snapshot.clone();
                desired.status = None;
                let value = serde_json::to_value(&desired)?;
                debug!(snapshot = %name, "creating VolumeSnapshot");
                api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&value))
                    .await?
            }
        };
        Ok(serde_json::from_value(serde_json::to_value(&current)?)?)
    }

    async fn delete_snapshots(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize, BackupError> {
        let api = self.api(namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        let snapshots = match api.list(&lp).await {
            Ok(list) => list.items,
            // Snapshot CRDs not installed: nothing to clean up
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut deleted = 0;
        for snapshot in snapshots {
            let name = snapshot.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}
