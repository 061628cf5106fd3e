//! Deletion orchestration
//!
//! A Backup being deleted keeps its finalizer until everything it produced
//! is gone. Every step is safe to repeat: a pass that stops early resumes
//! from the top on the next trigger and skips work already done.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use stratum_common::crd::{AccessMethod, ActionPhase, Backup, DeletionPolicy, JobActionSpec};
use stratum_common::events::{actions, reasons};
use stratum_common::kube_utils::{has_finalizer, label_selector};
use stratum_common::{
    metrics, DATA_PROTECTION_FINALIZER, LABEL_BACKUP_NAMESPACE, LABEL_BACKUP_POLICY,
    LABEL_MANAGED_BY,
};

use crate::action::{build_job, job_action_status, ActionContext, ActionKind, BackupAction, RepoAccess};
use crate::client::BackupClient;
use crate::config::EngineConfig;
use crate::controller::Context;
use crate::error::BackupError;
use crate::target::{workload_labels, TargetPod};
use crate::{REQUEUE_DELETE_WAIT_SECS, REQUEUE_RUNNING_SECS};

/// Label identifying the Job that deletes a backup's files.
///
/// Kept distinct from the backup-name label so the deletion Job is neither
/// removed with the backup's workloads nor waited on as one of them.
pub const LABEL_DELETE_BACKUP_FILES: &str = "dataprotection.stratum.dev/delete-backup-files";

/// Outcome of a request to delete a backup's stored files
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeletionStatus {
    /// Files are gone
    Succeeded,
    /// The deletion attempt failed; a later call starts a new attempt
    Failed {
        /// What went wrong
        reason: String,
    },
    /// Deletion is still running
    Deleting,
    /// The deleter could not determine the state
    Unknown {
        /// Why the state is unknown
        reason: String,
    },
}

impl DeletionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
            Self::Deleting => "Deleting",
            Self::Unknown { .. } => "Unknown",
        }
    }
}

/// Deletes the files a backup stored in its repository
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepositoryDeleter: Send + Sync {
    /// Start or observe deletion of the backup's files
    async fn delete_backup_files(&self, backup: &Backup) -> Result<DeletionStatus, BackupError>;
}

/// Deletes repository files by running a Job in the backup's namespace
pub struct KubeRepositoryDeleter {
    client: Client,
    backup_client: Arc<dyn BackupClient>,
    config: EngineConfig,
}

impl KubeRepositoryDeleter {
    /// Create a deleter
    pub fn new(client: Client, backup_client: Arc<dyn BackupClient>, config: EngineConfig) -> Self {
        Self {
            client,
            backup_client,
            config,
        }
    }
}

/// Build the Job that removes a backup's path from its repository
pub fn build_deletion_job(
    config: &EngineConfig,
    backup: &Backup,
    repo: RepoAccess,
    path: &str,
) -> Option<Job> {
    let command = match repo.access_method {
        AccessMethod::Mount => "rm -rf \"${DP_BACKUP_BASE_PATH}\"",
        AccessMethod::Tool => "datasafed rm -r \"${DP_BACKUP_BASE_PATH}\"",
    };
    let namespace = backup.namespace().unwrap_or_default();
    let ctx = ActionContext {
        backup_name: backup.name_any(),
        namespace: namespace.clone(),
        backup_path: Some(path.to_string()),
        repo: Some(repo),
        labels: BTreeMap::from([
            (LABEL_DELETE_BACKUP_FILES.to_string(), backup.name_any()),
            (LABEL_BACKUP_NAMESPACE.to_string(), namespace),
            (LABEL_MANAGED_BY.to_string(), stratum_common::APP_NAME.to_string()),
        ]),
        service_account: config.worker_service_account.clone(),
        executor_image: config.executor_image.clone(),
        ..Default::default()
    };
    let action = BackupAction {
        name: "delete-files".to_string(),
        target_pod: TargetPod::default(),
        container: None,
        service_account: None,
        kind: ActionKind::Job(JobActionSpec {
            image: config.executor_image.clone(),
            command: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            run_on_target_pod_node: false,
        }),
    };
    build_job(&ctx, &action)
}

#[async_trait]
impl RepositoryDeleter for KubeRepositoryDeleter {
    async fn delete_backup_files(&self, backup: &Backup) -> Result<DeletionStatus, BackupError> {
        let status = backup.status.as_ref();
        let (Some(repo_name), Some(path)) = (
            status.and_then(|s| s.backup_repo_name.clone()),
            status.and_then(|s| s.path.clone()).filter(|p| !p.is_empty()),
        ) else {
            // Snapshot backups and backups that never started stored nothing
            return Ok(DeletionStatus::Succeeded);
        };
        let Some(repo) = self.backup_client.get_backup_repo(&repo_name).await? else {
            warn!(backup = %backup.name_any(), repo = %repo_name, "backup repo is gone, skipping file deletion");
            return Ok(DeletionStatus::Succeeded);
        };
        let repo_status = repo.status.as_ref();
        let access = RepoAccess {
            name: repo_name,
            access_method: repo.spec.access_method,
            pvc_name: status
                .and_then(|s| s.persistent_volume_claim_name.clone())
                .or_else(|| repo_status.and_then(|s| s.backup_pvc_name.clone())),
            tool_config_secret: repo_status.and_then(|s| s.tool_config_secret_name.clone()),
        };

        let Some(desired) = build_deletion_job(&self.config, backup, access, &path) else {
            return Ok(DeletionStatus::Unknown {
                reason: "failed to build deletion job".to_string(),
            });
        };
        let name = desired.name_any();
        let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);

        let Some(job) = api.get_opt(&name).await? else {
            info!(job = %name, path = %path, "starting backup file deletion");
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(DeletionStatus::Deleting);
        };

        let deletion_action = BackupAction {
            name: "delete-files".to_string(),
            target_pod: TargetPod::default(),
            container: None,
            service_account: None,
            kind: ActionKind::Job(JobActionSpec::default()),
        };
        let observed = job_action_status(&deletion_action, &job);
        let background = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match observed.phase {
            ActionPhase::Completed => {
                if let Err(e) = api.delete(&name, &background).await {
                    debug!(job = %name, error = %e, "failed to remove finished deletion job");
                }
                Ok(DeletionStatus::Succeeded)
            }
            ActionPhase::Failed => {
                // Removing the failed Job lets the next call start a fresh attempt
                if let Err(e) = api.delete(&name, &background).await {
                    debug!(job = %name, error = %e, "failed to remove failed deletion job");
                }
                Ok(DeletionStatus::Failed {
                    reason: observed
                        .failure_reason
                        .unwrap_or_else(|| format!("deletion job {name} failed")),
                })
            }
            _ => Ok(DeletionStatus::Deleting),
        }
    }
}

/// Request background deletion of backups that chain onto this one
async fn delete_related_backups(client: &dyn BackupClient, backup: &Backup) -> Result<(), BackupError> {
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
    let name = backup.name_any();
    let labels = BTreeMap::from([(
        LABEL_BACKUP_POLICY.to_string(),
        backup.spec.backup_policy_name.clone(),
    )]);
    for related in client.list_backups(&namespace, &labels).await? {
        if related.meta().deletion_timestamp.is_some() || related.name_any() == name {
            continue;
        }
        let status = related.status.as_ref();
        let chained = status.and_then(|s| s.parent_backup_name.as_deref()) == Some(name.as_str())
            || status.and_then(|s| s.base_backup_name.as_deref()) == Some(name.as_str());
        if chained {
            info!(backup = %name, related = %related.name_any(), "deleting dependent backup");
            client.delete_backup(&related.name_any(), &namespace).await?;
        }
    }
    Ok(())
}

fn namespaces(backup: &Backup, config: &EngineConfig) -> Vec<String> {
    let mut namespaces = vec![backup.namespace().unwrap_or_default()];
    if !namespaces.contains(&config.controller_namespace) {
        namespaces.push(config.controller_namespace.clone());
    }
    namespaces
}

async fn execution_pods_remaining(
    client: &dyn BackupClient,
    backup: &Backup,
    config: &EngineConfig,
) -> Result<bool, BackupError> {
    let selector = label_selector(&workload_labels(backup));
    for namespace in namespaces(backup, config) {
        if !client.list_pods(&namespace, &selector).await?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run one pass of the deletion cascade for a Backup in the Deleting phase
pub async fn handle_deleting(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let name = backup.name_any();
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;

    if !has_finalizer(backup, DATA_PROTECTION_FINALIZER) {
        debug!(backup = %name, "no finalizer, nothing to clean up");
        return Ok(Action::await_change());
    }

    delete_related_backups(ctx.client.as_ref(), backup).await?;

    let labels = workload_labels(backup);
    for ns in namespaces(backup, &ctx.config) {
        ctx.client.delete_workloads(&ns, &labels).await?;
    }

    if backup.spec.deletion_policy == DeletionPolicy::Retain {
        warn!(backup = %name, "deletionPolicy is Retain, keeping backup data");
        ctx.events
            .publish(
                &backup.object_ref(&()),
                EventType::Warning,
                reasons::RETAIN,
                actions::DELETE,
                Some("backup deletionPolicy is Retain, the backup data is kept".to_string()),
            )
            .await;
        return Ok(Action::await_change());
    }

    if execution_pods_remaining(ctx.client.as_ref(), backup, &ctx.config).await? {
        debug!(backup = %name, "waiting for backup pods to terminate");
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_DELETE_WAIT_SECS)));
    }

    let removed = ctx.snapshots.delete_snapshots(&namespace, &labels).await?;
    if removed > 0 {
        info!(backup = %name, count = removed, "deleted volume snapshots");
    }

    let outcome = ctx.deleter.delete_backup_files(backup).await?;
    metrics::record_file_deletion(outcome.as_str());
    match outcome {
        DeletionStatus::Succeeded => {
            let finalizers: Vec<String> = backup
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != DATA_PROTECTION_FINALIZER)
                .cloned()
                .collect();
            ctx.client
                .patch_backup_metadata(backup, backup.labels(), backup.annotations(), &finalizers)
                .await?;
            ctx.events
                .publish(
                    &backup.object_ref(&()),
                    EventType::Normal,
                    reasons::DELETING_BACKUP,
                    actions::DELETE,
                    Some("backup files deleted, releasing finalizer".to_string()),
                )
                .await;
            info!(backup = %name, "backup cleanup finished, finalizer removed");
            Ok(Action::await_change())
        }
        DeletionStatus::Failed { reason } => {
            let recorded = backup.status.as_ref().and_then(|s| s.failure_reason.as_deref());
            if recorded != Some(reason.as_str()) {
                let mut status = backup.status.clone().unwrap_or_default();
                status.failure_reason = Some(reason.clone());
                ctx.client.patch_backup_status(backup, &status).await?;
                ctx.events
                    .publish(
                        &backup.object_ref(&()),
                        EventType::Warning,
                        reasons::DELETE_BACKUP_FILES_FAILED,
                        actions::DELETE,
                        Some(reason),
                    )
                    .await;
            }
            Ok(Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)))
        }
        DeletionStatus::Deleting => Err(BackupError::requeue(format!(
            "deleting backup files of {namespace}/{name}"
        ))),
        DeletionStatus::Unknown { reason } => Err(BackupError::requeue(format!(
            "backup file deletion state of {namespace}/{name} is unknown: {reason}"
        ))),
    }
}
