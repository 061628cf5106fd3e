//! Kubernetes access for the backup controller
//!
//! Everything the engine reads or writes goes through [`BackupClient`] so the
//! state machine can be exercised with mocks. [`KubeBackupClient`] is the
//! production implementation over kube-rs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use stratum_common::crd::{ActionSet, Backup, BackupPolicy, BackupRepo, BackupSchedule, BackupStatus};
use stratum_common::kube_utils::{self, build_api_resource, label_selector};
use stratum_common::{ANNOTATION_OPS_REQUEST, ANNOTATION_RESTORE_FROM_BACKUP};

use crate::error::BackupError;
use crate::FIELD_MANAGER;

/// apiVersion of the database Cluster a backup belongs to
pub const TARGET_CLUSTER_API_VERSION: &str = "apps.stratum.dev/v1";
/// kind of the database Cluster a backup belongs to
pub const TARGET_CLUSTER_KIND: &str = "Cluster";

/// Phase a stopped database Cluster reports
const CLUSTER_PHASE_STOPPED: &str = "Stopped";

/// Cluster annotations left out of the snapshot recorded on a Backup
const SNAPSHOT_DROPPED_ANNOTATIONS: [&str; 2] = [
    ANNOTATION_OPS_REQUEST,
    "kubectl.kubernetes.io/last-applied-configuration",
];

/// The parts of the database Cluster the backup engine cares about
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetCluster {
    /// Cluster name
    pub name: String,
    /// Cluster UID
    pub uid: Option<String>,
    /// deletionTimestamp is set
    pub deleting: bool,
    /// status.phase
    pub phase: Option<String>,
    /// A restore is running against the cluster
    pub restoring: bool,
    /// JSON of the cluster's type, name, namespace, annotations and spec
    pub snapshot: Option<String>,
}

impl TargetCluster {
    /// True once the cluster has been stopped
    pub fn is_stopped(&self) -> bool {
        self.phase.as_deref() == Some(CLUSTER_PHASE_STOPPED)
    }

    fn from_dynamic(obj: &DynamicObject) -> Self {
        Self {
            name: obj.name_any(),
            uid: obj.metadata.uid.clone(),
            deleting: obj.metadata.deletion_timestamp.is_some(),
            phase: obj
                .data
                .pointer("/status/phase")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            restoring: obj
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(ANNOTATION_RESTORE_FROM_BACKUP)),
            snapshot: serde_json::to_string(&cluster_snapshot(obj)).ok(),
        }
    }
}

/// What a restore needs to recreate the cluster: no status, no server-set metadata
fn cluster_snapshot(obj: &DynamicObject) -> serde_json::Value {
    let annotations: BTreeMap<&String, &String> = obj
        .annotations()
        .iter()
        .filter(|(k, _)| !SNAPSHOT_DROPPED_ANNOTATIONS.contains(&k.as_str()))
        .collect();
    let (api_version, kind) = match &obj.types {
        Some(t) => (t.api_version.as_str(), t.kind.as_str()),
        None => (TARGET_CLUSTER_API_VERSION, TARGET_CLUSTER_KIND),
    };
    serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": obj.name_any(),
            "namespace": obj.namespace(),
            "annotations": annotations,
        },
        "spec": obj.data.get("spec").cloned().unwrap_or_default(),
    })
}

/// Trait abstracting Kubernetes operations for the backup controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupClient: Send + Sync {
    /// Get a Backup, None if it does not exist
    async fn get_backup(&self, name: &str, namespace: &str) -> Result<Option<Backup>, BackupError>;

    /// List Backups in a namespace carrying all the given labels
    async fn list_backups(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Backup>, BackupError>;

    /// Get a BackupPolicy
    async fn get_backup_policy(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BackupPolicy>, BackupError>;

    /// Get a cluster-scoped ActionSet
    async fn get_action_set(&self, name: &str) -> Result<Option<ActionSet>, BackupError>;

    /// Get a cluster-scoped BackupRepo
    async fn get_backup_repo(&self, name: &str) -> Result<Option<BackupRepo>, BackupError>;

    /// List all BackupRepos
    async fn list_backup_repos(&self) -> Result<Vec<BackupRepo>, BackupError>;

    /// Get a BackupSchedule
    async fn get_backup_schedule(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BackupSchedule>, BackupError>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, BackupError>;

    /// Check whether a PersistentVolumeClaim exists
    async fn pvc_exists(&self, name: &str, namespace: &str) -> Result<bool, BackupError>;

    /// List pods matching a label selector string
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, BackupError>;

    /// Get the database Cluster a backup belongs to
    async fn get_target_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<TargetCluster>, BackupError>;

    /// Replace the Backup's status, conditional on its observed resourceVersion
    async fn patch_backup_status(
        &self,
        backup: &Backup,
        status: &BackupStatus,
    ) -> Result<Backup, BackupError>;

    /// List Secrets matching a label selector string
    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>, BackupError>;

    /// Set the Backup's labels, annotations and finalizers, conditional on
    /// its resourceVersion
    async fn patch_backup_metadata(
        &self,
        backup: &Backup,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        finalizers: &[String],
    ) -> Result<Backup, BackupError>;

    /// Delete a Backup with background propagation
    async fn delete_backup(&self, name: &str, namespace: &str) -> Result<(), BackupError>;

    /// Delete Jobs and StatefulSets carrying all the given labels
    async fn delete_workloads(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackupError>;

    /// Scale StatefulSets carrying all the given labels to zero replicas
    async fn stop_statefulsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackupError>;
}

/// Real Kubernetes client implementation
pub struct KubeBackupClient {
    client: Client,
}

impl KubeBackupClient {
    /// Create a new KubeBackupClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

#[async_trait]
impl BackupClient for KubeBackupClient {
    async fn get_backup(&self, name: &str, namespace: &str) -> Result<Option<Backup>, BackupError> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_backups(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Backup>, BackupError> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&lp).await?.items)
    }

    async fn get_backup_policy(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BackupPolicy>, BackupError> {
        let api: Api<BackupPolicy> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_action_set(&self, name: &str) -> Result<Option<ActionSet>, BackupError> {
        let api: Api<ActionSet> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_backup_repo(&self, name: &str) -> Result<Option<BackupRepo>, BackupError> {
        let api: Api<BackupRepo> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_backup_repos(&self) -> Result<Vec<BackupRepo>, BackupError> {
        let api: Api<BackupRepo> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_backup_schedule(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BackupSchedule>, BackupError> {
        let api: Api<BackupSchedule> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, BackupError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn pvc_exists(&self, name: &str, namespace: &str) -> Result<bool, BackupError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, BackupError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn get_target_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<TargetCluster>, BackupError> {
        let ar = build_api_resource(TARGET_CLUSTER_API_VERSION, TARGET_CLUSTER_KIND);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        Ok(api
            .get_opt(name)
            .await?
            .map(|obj| TargetCluster::from_dynamic(&obj)))
    }

    async fn patch_backup_status(
        &self,
        backup: &Backup,
        status: &BackupStatus,
    ) -> Result<Backup, BackupError> {
        let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
        let old = serde_json::to_value(backup.status.clone().unwrap_or_default())?;
        let new = serde_json::to_value(status)?;
        let patch = kube_utils::merge_patch_from(&old, &new);
        let updated = kube_utils::patch_status_with_version(
            &self.client,
            &backup.name_any(),
            &namespace,
            backup.resource_version().as_deref(),
            &patch,
            FIELD_MANAGER,
        )
        .await?;
        Ok(updated)
    }

    async fn list_secrets(&self, namespace: &str, selector: &str) -> Result<Vec<Secret>, BackupError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn patch_backup_metadata(
        &self,
        backup: &Backup,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
        finalizers: &[String],
    ) -> Result<Backup, BackupError> {
        let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
        let updated = kube_utils::patch_metadata(
            &self.client,
            &backup.name_any(),
            &namespace,
            backup.resource_version().as_deref(),
            labels,
            annotations,
            finalizers,
            FIELD_MANAGER,
        )
        .await?;
        Ok(updated)
    }

    async fn delete_backup(&self, name: &str, namespace: &str) -> Result<(), BackupError> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &background_delete()).await {
            Ok(_) => Ok(()),
            Err(e) if stratum_common::error::is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_workloads(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackupError> {
        let lp = ListParams::default().labels(&label_selector(labels));
        let dp = background_delete();

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        for job in jobs.list(&lp).await?.items {
            if job.metadata.deletion_timestamp.is_some() {
                continue;
            }
            debug!(job = %job.name_any(), namespace, "deleting backup job");
            match jobs.delete(&job.name_any(), &dp).await {
                Ok(_) => {}
                Err(e) if stratum_common::error::is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let sts: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        for set in sts.list(&lp).await?.items {
            if set.metadata.deletion_timestamp.is_some() {
                continue;
            }
            debug!(statefulset = %set.name_any(), namespace, "deleting backup statefulset");
            match sts.delete(&set.name_any(), &dp).await {
                Ok(_) => {}
                Err(e) if stratum_common::error::is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn stop_statefulsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), BackupError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        let patch = serde_json::json!({ "spec": { "replicas": 0 } });
        for set in api.list(&lp).await?.items {
            let replicas = set.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if replicas == 0 {
                continue;
            }
            debug!(statefulset = %set.name_any(), namespace, "stopping backup statefulset");
            api.patch(
                &set.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_object(annotations: Option<BTreeMap<String, String>>, phase: &str) -> DynamicObject {
        let ar = build_api_resource(TARGET_CLUSTER_API_VERSION, TARGET_CLUSTER_KIND);
        let mut obj = DynamicObject::new("pg-cluster", &ar)
            .within("default")
            .data(serde_json::json!({ "status": { "phase": phase } }));
        obj.metadata.annotations = annotations;
        obj.metadata.uid = Some("uid-1".to_string());
        obj
    }

    #[test]
    fn test_target_cluster_from_dynamic_object() {
        let cluster = TargetCluster::from_dynamic(&cluster_object(None, "Running"));
        assert_eq!(cluster.name, "pg-cluster");
        assert_eq!(cluster.uid.as_deref(), Some("uid-1"));
        assert!(!cluster.deleting);
        assert!(!cluster.restoring);
        assert!(!cluster.is_stopped());
    }

    #[test]
    fn test_target_cluster_restore_annotation_and_stopped_phase() {
        let annotations = BTreeMap::from([(
            ANNOTATION_RESTORE_FROM_BACKUP.to_string(),
            "{}".to_string(),
        )]);
        let cluster = TargetCluster::from_dynamic(&cluster_object(Some(annotations), "Stopped"));
        assert!(cluster.restoring);
        assert!(cluster.is_stopped());
    }

    #[test]
    fn test_cluster_snapshot_keeps_spec_and_drops_transient_metadata() {
        let mut obj = cluster_object(
            Some(BTreeMap::from([
                ("team".to_string(), "payments".to_string()),
                (ANNOTATION_OPS_REQUEST.to_string(), "[]".to_string()),
                (
                    "kubectl.kubernetes.io/last-applied-configuration".to_string(),
                    "{}".to_string(),
                ),
            ])),
            "Running",
        );
        obj.data = serde_json::json!({
            "spec": { "componentSpecs": [{ "name": "postgresql", "replicas": 3 }] },
            "status": { "phase": "Running" }
        });

        let cluster = TargetCluster::from_dynamic(&obj);
        let snapshot: serde_json::Value =
            serde_json::from_str(cluster.snapshot.as_deref().unwrap()).unwrap();
        assert_eq!(snapshot["apiVersion"], TARGET_CLUSTER_API_VERSION);
        assert_eq!(snapshot["kind"], TARGET_CLUSTER_KIND);
        assert_eq!(snapshot["metadata"]["name"], "pg-cluster");
        assert_eq!(snapshot["metadata"]["namespace"], "default");
        assert_eq!(
            snapshot["metadata"]["annotations"],
            serde_json::json!({ "team": "payments" })
        );
        assert_eq!(snapshot["spec"]["componentSpecs"][0]["replicas"], 3);
        assert!(snapshot.get("status").is_none());
        assert!(snapshot["metadata"].get("uid").is_none());
    }
}
