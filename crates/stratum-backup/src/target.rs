//! Target resolution
//!
//! Turns the BackupTargets of a policy or method into concrete pods. Once a
//! selection has been recorded in the Backup's status it is reused verbatim,
//! so later passes act on the same pods even if the cluster topology moved.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use stratum_common::crd::{
    Backup, BackupMethod, BackupPolicy, BackupStatusTarget, BackupTarget, BackupType,
    LabelSelector, PodSelectionStrategy,
};
use stratum_common::{LABEL_BACKUP_NAME, LABEL_BACKUP_NAMESPACE};

use crate::client::BackupClient;
use crate::error::BackupError;

/// The parts of a pod backup workloads need
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetPod {
    /// Pod name
    pub name: String,
    /// Node the pod runs on
    pub node_name: Option<String>,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// Pod volume name to PersistentVolumeClaim name
    pub claims: BTreeMap<String, String>,
}

impl TargetPod {
    /// A pod known only by its recorded name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Extract the fields we need from a live pod
    pub fn from_pod(pod: &Pod) -> Self {
        let claims = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .filter_map(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .map(|pvc| (v.name.clone(), pvc.claim_name.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: pod.name_any(),
            node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            labels: pod.labels().clone(),
            claims,
        }
    }
}

/// A target with the pods it resolved to
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTarget {
    /// Target and recorded pod names, as stored in status
    pub status: BackupStatusTarget,
    /// Pod details in the same order as `status.selected_target_pods`
    pub pods: Vec<TargetPod>,
}

/// Targets a backup runs against, in the shape they are recorded in status
#[derive(Clone, Debug, PartialEq)]
pub enum TargetSpec {
    /// Recorded as `status.target`
    Single(BackupTarget),
    /// Recorded as `status.targets`
    Multiple(Vec<BackupTarget>),
}

impl TargetSpec {
    /// The targets in declaration order
    pub fn targets(&self) -> Vec<&BackupTarget> {
        match self {
            Self::Single(t) => vec![t],
            Self::Multiple(ts) => ts.iter().collect(),
        }
    }
}

/// Pick the targets for a backup.
///
/// Method-level settings win over policy-level ones; a single `target` wins
/// over a `targets` list at the same level.
pub fn select_target_spec(
    policy: &BackupPolicy,
    method: &BackupMethod,
) -> Result<TargetSpec, BackupError> {
    if let Some(target) = &method.target {
        return Ok(TargetSpec::Single(target.clone()));
    }
    if !method.targets.is_empty() {
        return Ok(TargetSpec::Multiple(method.targets.clone()));
    }
    if let Some(target) = &policy.spec.target {
        return Ok(TargetSpec::Single(target.clone()));
    }
    if !policy.spec.targets.is_empty() {
        return Ok(TargetSpec::Multiple(policy.spec.targets.clone()));
    }
    Err(BackupError::fatal(format!(
        "backup target/targets can not be empty in backupPolicy {:?}",
        policy.name_any()
    )))
}

/// Labels stamped on every workload created for a backup
pub fn workload_labels(backup: &Backup) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_BACKUP_NAME.to_string(), backup.name_any()),
        (
            LABEL_BACKUP_NAMESPACE.to_string(),
            backup.namespace().unwrap_or_default(),
        ),
        (
            stratum_common::LABEL_MANAGED_BY.to_string(),
            stratum_common::APP_NAME.to_string(),
        ),
    ])
}

fn recorded_pods<'a>(backup: &'a Backup, target_name: &str) -> Option<&'a [String]> {
    backup
        .status
        .as_ref()?
        .all_targets()
        .into_iter()
        .find(|t| t.target.name == target_name && !t.selected_target_pods.is_empty())
        .map(|t| t.selected_target_pods.as_slice())
}

fn is_available(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
}

async fn list_selected(
    client: &dyn BackupClient,
    namespace: &str,
    selector: &LabelSelector,
) -> Result<Vec<Pod>, BackupError> {
    client
        .list_pods(namespace, &selector.to_selector_string())
        .await
}

/// Pods matching a target's selector, falling back to the fallback selector
async fn live_pods(
    client: &dyn BackupClient,
    namespace: &str,
    target: &BackupTarget,
) -> Result<Vec<Pod>, BackupError> {
    let selector = &target.pod_selector;
    let mut pods = list_selected(client, namespace, &selector.label_selector).await?;
    if pods.is_empty() {
        if let Some(fallback) = &selector.fallback_label_selector {
            pods = list_selected(client, namespace, fallback).await?;
        }
    }
    pods.sort_by_key(|p| p.name_any());
    Ok(pods)
}

/// Apply the selection strategy to live pods sorted by name
pub fn select_pods(pods: &[Pod], strategy: PodSelectionStrategy) -> Vec<TargetPod> {
    let available = pods.iter().filter(|p| is_available(p)).map(TargetPod::from_pod);
    match strategy {
        PodSelectionStrategy::Any => available.take(1).collect(),
        PodSelectionStrategy::All => available.collect(),
    }
}

/// Resolve one target to its pods.
///
/// Order of precedence: pods already recorded in the backup's status, then
/// the parent backup's recorded pods when the target opts in, then a live
/// selection. A Continuous backup that resolves no pods has its
/// StatefulSets stopped so they release the volumes they hold.
pub async fn resolve_target(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
    parent: Option<&Backup>,
    target: &BackupTarget,
    backup_type: BackupType,
) -> Result<ResolvedTarget, BackupError> {
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;

    let mut names: Option<Vec<String>> = recorded_pods(backup, &target.name).map(<[String]>::to_vec);
    if names.is_none() && target.pod_selector.use_parent_selected_pods {
        if let Some(parent) = parent {
            names = recorded_pods(parent, &target.name).map(<[String]>::to_vec);
            if names.is_some() {
                debug!(parent = %parent.name_any(), target = %target.name, "reusing parent's selected pods");
            }
        }
    }

    let pods = match names {
        Some(names) => {
            let live = live_pods(client, &namespace, target).await?;
            names
                .into_iter()
                .map(|name| {
                    live.iter()
                        .find(|p| p.name_any() == name)
                        .map(TargetPod::from_pod)
                        .unwrap_or_else(|| TargetPod::named(name))
                })
                .collect()
        }
        None => {
            let live = live_pods(client, &namespace, target).await?;
            select_pods(&live, target.pod_selector.strategy)
        }
    };

    if pods.is_empty() {
        if backup_type == BackupType::Continuous {
            warn!(backup = %backup.name_any(), target = %target.name, "no target pods, stopping continuous backup workloads");
            client
                .stop_statefulsets(&namespace, &workload_labels(backup))
                .await?;
        }
        return Err(BackupError::fatal(format!(
            "failed to get target pods by backup policy {}/{}",
            policy.namespace().unwrap_or_default(),
            policy.name_any()
        )));
    }

    Ok(ResolvedTarget {
        status: BackupStatusTarget {
            target: target.clone(),
            selected_target_pods: pods.iter().map(|p| p.name.clone()).collect(),
        },
        pods,
    })
}

/// Resolve every target of a spec
pub async fn resolve_targets(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
    parent: Option<&Backup>,
    spec: &TargetSpec,
    backup_type: BackupType,
) -> Result<Vec<ResolvedTarget>, BackupError> {
    let mut resolved = Vec::new();
    for target in spec.targets() {
        resolved.push(resolve_target(client, backup, policy, parent, target, backup_type).await?);
    }
    Ok(resolved)
}
