//! Request building
//!
//! A [`Request`] is the working copy one reconcile pass operates on: the
//! observed Backup, everything it references, and the status the pass
//! intends to commit. It is built from read-only lookups and discarded at
//! the end of the pass.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::debug;

use stratum_common::crd::{
    AccessMethod, ActionSet, ActionSpec, Backup, BackupMethod, BackupPhase,
    BackupPolicy, BackupRepo, BackupRepoPhase, BackupStatus, BackupType, EncryptionConfig,
    EnvVar,
};
use stratum_common::{
    APP_NAME, LABEL_APP_COMPONENT, LABEL_APP_INSTANCE, LABEL_BACKUP_POLICY, LABEL_BACKUP_REPO,
    LABEL_BACKUP_SCHEDULE, LABEL_BACKUP_TYPE, LABEL_MANAGED_BY, LABEL_WAIT_REPO_PREPARATION,
};

use crate::action::{ActionContext, ActionKind, BackupAction, RepoAccess};
use crate::client::BackupClient;
use crate::config::EngineConfig;
use crate::error::BackupError;
use crate::lineage::{resolve_lineage, Lineage};
use crate::target::{resolve_targets, select_target_spec, workload_labels, ResolvedTarget, TargetSpec};
use crate::BACKUP_FORMAT_VERSION;

/// Action name of the snapshot action
pub const SNAPSHOT_ACTION: &str = "create-volume-snapshot";
/// Action name of the main data action
pub const BACKUP_DATA_ACTION: &str = "backup-data";

/// Working copy for one reconcile pass
#[derive(Clone, Debug)]
pub struct Request {
    /// Backup as observed at the start of the pass
    pub backup: Backup,
    /// Status this pass will commit
    pub status: BackupStatus,
    /// Referenced BackupPolicy
    pub policy: BackupPolicy,
    /// Method being run, as recorded in status once the backup started
    pub method: BackupMethod,
    /// ActionSet of an action-set method
    pub action_set: Option<ActionSet>,
    /// Effective backup type
    pub backup_type: BackupType,
    /// Bound repository, none for snapshot methods
    pub repo: Option<BackupRepo>,
    /// The repo's PVC or tool config exists in the backup's namespace
    pub repo_prepared: bool,
    /// Parent and base of an incremental backup
    pub lineage: Option<Lineage>,
    /// Targets in the shape they are recorded
    pub target_spec: TargetSpec,
    /// Targets with their resolved pods
    pub targets: Vec<ResolvedTarget>,
}

impl Request {
    /// Namespace of the Backup
    pub fn namespace(&self) -> String {
        self.backup.namespace().unwrap_or_default()
    }

    /// True for snapshot methods
    pub fn is_snapshot(&self) -> bool {
        self.method.is_snapshot()
    }

    /// `/<repo prefix>/<namespace>/<policy prefix>`, empty segments skipped
    fn path_prefix(&self) -> String {
        let repo_prefix = self.repo.as_ref().and_then(|r| r.spec.path_prefix.clone());
        let namespace = self.namespace();
        let segments: Vec<&str> = [
            repo_prefix.as_deref().unwrap_or_default(),
            namespace.as_str(),
            self.policy.spec.path_prefix.as_deref().unwrap_or_default(),
        ]
        .into_iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect();
        format!("/{}", segments.join("/"))
    }

    /// Repository path of this backup's data
    pub fn backup_path(&self) -> String {
        format!("{}/{}", self.path_prefix(), self.backup.name_any())
    }

    /// Repository path of the shared kopia repository
    pub fn kopia_repo_path(&self) -> String {
        format!("{}/kopia", self.path_prefix())
    }

    /// Encryption config: inherited from the parent when chaining, else the policy's
    pub fn encryption(&self) -> Option<EncryptionConfig> {
        match &self.lineage {
            Some(lineage) => lineage
                .parent
                .status
                .as_ref()
                .and_then(|s| s.encryption_config.clone()),
            None => self.policy.spec.encryption_config.clone(),
        }
    }

    fn repo_access(&self) -> Option<RepoAccess> {
        let repo = self.repo.as_ref()?;
        let status = repo.status.as_ref();
        Some(RepoAccess {
            name: repo.name_any(),
            access_method: repo.spec.access_method,
            pvc_name: status.and_then(|s| s.backup_pvc_name.clone()),
            tool_config_secret: status.and_then(|s| s.tool_config_secret_name.clone()),
        })
    }

    /// Labels the Backup must carry once it leaves New
    pub fn backup_labels(&self, cluster_uid: Option<&str>) -> BTreeMap<String, String> {
        let mut labels = self.backup.labels().clone();
        labels.insert(LABEL_MANAGED_BY.to_string(), APP_NAME.to_string());
        labels.insert(LABEL_BACKUP_TYPE.to_string(), self.backup_type.to_string());
        labels.insert(LABEL_BACKUP_POLICY.to_string(), self.policy.name_any());
        if let Some(repo) = &self.repo {
            labels.insert(LABEL_BACKUP_REPO.to_string(), repo.name_any());
        }
        if let Some(pod) = self.targets.first().and_then(|t| t.pods.first()) {
            for key in [LABEL_APP_INSTANCE, LABEL_APP_COMPONENT] {
                if let Some(value) = pod.labels.get(key) {
                    labels.insert(key.to_string(), value.clone());
                }
            }
        }
        if let Some(uid) = cluster_uid {
            labels.insert(stratum_common::LABEL_CLUSTER_UID.to_string(), uid.to_string());
        }
        if self.repo.is_some() && !self.repo_prepared {
            labels.insert(LABEL_WAIT_REPO_PREPARATION.to_string(), "true".to_string());
        } else {
            labels.remove(LABEL_WAIT_REPO_PREPARATION);
        }
        labels
    }

    /// Environment for workloads: ActionSet, then method, then parameters
    fn workload_env(&self) -> Vec<EnvVar> {
        let mut env: Vec<EnvVar> = self
            .action_set
            .as_ref()
            .map(|a| a.spec.env.clone())
            .unwrap_or_default();
        env.extend(self.method.env.iter().cloned());
        env.extend(self.backup.spec.parameters.iter().map(|p| EnvVar {
            name: p.name.clone(),
            value: p.value.clone(),
        }));
        env
    }

    /// Execution context shared by every action of this backup
    pub fn action_context(&self, config: &EngineConfig) -> ActionContext {
        ActionContext {
            backup_name: self.backup.name_any(),
            namespace: self.namespace(),
            backup_type: self.backup_type,
            backup_path: self.status.path.clone(),
            repo: self.repo_access(),
            parent_backup_name: self.status.parent_backup_name.clone(),
            base_backup_name: self.status.base_backup_name.clone(),
            env: self.workload_env(),
            labels: workload_labels(&self.backup),
            service_account: config.worker_service_account.clone(),
            executor_image: config.executor_image.clone(),
            deadline: config.job_deadline(self.backup_type),
            target_volumes: self.method.target_volumes.clone(),
            encryption: self.status.encryption_config.clone(),
        }
    }

    fn action_kind(&self, spec: &ActionSpec, name: &str) -> Result<ActionKind, BackupError> {
        match (&spec.job, &spec.exec) {
            (Some(job), None) => Ok(ActionKind::Job(job.clone())),
            (None, Some(exec)) => Ok(ActionKind::Exec(exec.clone())),
            _ => Err(BackupError::fatal(format!(
                "action {name} of actionSet {} must specify exactly one of job or exec",
                self.action_set.as_ref().map(|a| a.name_any()).unwrap_or_default()
            ))),
        }
    }

    /// Ordered actions for every target pod
    pub fn build_actions(&self) -> Result<Vec<BackupAction>, BackupError> {
        let mut actions = Vec::new();
        for target in &self.targets {
            for pod in &target.pods {
                let action = |name: String, kind: ActionKind| BackupAction {
                    name,
                    target_pod: pod.clone(),
                    container: target.status.target.container.clone(),
                    service_account: target.status.target.service_account_name.clone(),
                    kind,
                };

                if self.is_snapshot() {
                    actions.push(action(SNAPSHOT_ACTION.to_string(), ActionKind::Snapshot));
                    continue;
                }

                let Some(action_set) = &self.action_set else {
                    continue;
                };
                let Some(backup) = &action_set.spec.backup else {
                    return Err(BackupError::fatal(format!(
                        "actionSet {} does not define backup actions",
                        action_set.name_any()
                    )));
                };
                for (i, spec) in backup.pre_backup.iter().enumerate() {
                    let name = format!("pre-backup-{i}");
                    actions.push(action(name.clone(), self.action_kind(spec, &name)?));
                }
                if let Some(data) = &backup.backup_data {
                    let kind = if self.backup_type == BackupType::Continuous {
                        ActionKind::StatefulSet(data.clone())
                    } else {
                        ActionKind::Job(data.clone())
                    };
                    actions.push(action(BACKUP_DATA_ACTION.to_string(), kind));
                }
                for (i, spec) in backup.post_backup.iter().enumerate() {
                    let name = format!("post-backup-{i}");
                    actions.push(action(name.clone(), self.action_kind(spec, &name)?));
                }
            }
        }
        Ok(actions)
    }

    /// Populate the status for the transition from New to Running
    pub fn init_running_status(&mut self, now: DateTime<Utc>) -> Result<(), BackupError> {
        let actions = self.build_actions()?;
        let status = &mut self.status;
        status.format_version = Some(BACKUP_FORMAT_VERSION.to_string());
        status.backup_method = Some(self.method.clone());
        status.backup_repo_name = self.repo.as_ref().map(|r| r.name_any());
        status.persistent_volume_claim_name = self
            .repo
            .as_ref()
            .filter(|r| r.spec.access_method == AccessMethod::Mount)
            .and_then(|r| r.status.as_ref())
            .and_then(|s| s.backup_pvc_name.clone());
        status.parent_backup_name = self.lineage.as_ref().map(|l| l.parent.name_any());
        status.base_backup_name = self.lineage.as_ref().map(|l| l.base.name_any());
        match &self.target_spec {
            TargetSpec::Single(_) => {
                status.target = self.targets.first().map(|t| t.status.clone());
                status.targets.clear();
            }
            TargetSpec::Multiple(_) => {
                status.target = None;
                status.targets = self.targets.iter().map(|t| t.status.clone()).collect();
            }
        }
        status.actions = actions.iter().map(BackupAction::new_status).collect();
        status.phase = Some(BackupPhase::Running);
        status.start_timestamp = Some(now);
        status.failure_reason = None;

        let encryption = self.encryption();
        let path = (!self.is_snapshot()).then(|| self.backup_path());
        let kopia = (!self.is_snapshot() && self.policy.spec.use_kopia).then(|| self.kopia_repo_path());
        self.status.encryption_config = encryption;
        self.status.path = path;
        self.status.kopia_repo_path = kopia;
        Ok(())
    }
}

fn require_method(policy: &BackupPolicy, backup: &Backup) -> Result<BackupMethod, BackupError> {
    if let Some(recorded) = backup.status.as_ref().and_then(|s| s.backup_method.clone()) {
        return Ok(recorded);
    }
    policy
        .spec
        .method(&backup.spec.backup_method)
        .cloned()
        .ok_or_else(|| {
            BackupError::fatal(format!("backupMethod: {} not found", backup.spec.backup_method))
        })
}

fn check_mode(method: &BackupMethod) -> Result<(), BackupError> {
    match (method.is_snapshot(), method.action_set()) {
        (false, None) => Err(BackupError::fatal(format!(
            "backup method {} should specify snapshotVolumes or actionSetName",
            method.name
        ))),
        (true, Some(_)) => Err(BackupError::fatal(format!(
            "backup method {} should specify either snapshotVolumes or actionSetName, not both",
            method.name
        ))),
        _ => Ok(()),
    }
}

async fn check_encryption(
    client: &dyn BackupClient,
    policy: &BackupPolicy,
) -> Result<(), BackupError> {
    let Some(enc) = &policy.spec.encryption_config else {
        return Ok(());
    };
    let namespace = policy.namespace().unwrap_or_default();
    let secret_ref = &enc.pass_phrase_secret_key_ref;
    let secret = client
        .get_secret(&secret_ref.name, &namespace)
        .await?
        .ok_or_else(|| {
            BackupError::requeue(format!(
                "failed to validate backupPolicy's encryption config: secret {namespace}/{} not found",
                secret_ref.name
            ))
        })?;
    let has_key = secret
        .data
        .as_ref()
        .is_some_and(|d| d.get(&secret_ref.key).is_some_and(|v: &ByteString| !v.0.is_empty()))
        || secret
            .string_data
            .as_ref()
            .is_some_and(|d| d.contains_key(&secret_ref.key));
    if !has_key {
        return Err(BackupError::fatal(format!(
            "failed to validate backupPolicy's encryption config: key {} not found in secret {namespace}/{}",
            secret_ref.key, secret_ref.name
        )));
    }
    Ok(())
}

async fn bind_repo(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
) -> Result<BackupRepo, BackupError> {
    let recorded = backup.status.as_ref().and_then(|s| s.backup_repo_name.clone());
    let name = recorded.or_else(|| policy.spec.backup_repo_name.clone()).filter(|n| !n.is_empty());

    let repo = match name {
        Some(name) => client
            .get_backup_repo(&name)
            .await?
            .ok_or_else(|| BackupError::requeue(format!("backupRepo {name} not found")))?,
        None => {
            let mut defaults: Vec<BackupRepo> = client
                .list_backup_repos()
                .await?
                .into_iter()
                .filter(BackupRepo::is_default)
                .collect();
            match defaults.len() {
                0 => return Err(BackupError::fatal("no default BackupRepo found")),
                1 => defaults.remove(0),
                n => {
                    return Err(BackupError::fatal(format!(
                        "{n} default BackupRepos found, expected exactly one"
                    )))
                }
            }
        }
    };

    match repo.phase() {
        BackupRepoPhase::Ready => Ok(repo),
        BackupRepoPhase::PreChecking => Err(BackupError::requeue(format!(
            "backupRepo {} is not ready yet",
            repo.name_any()
        ))),
        BackupRepoPhase::Failed | BackupRepoPhase::Deleting => Err(BackupError::fatal(format!(
            "backupRepo {} is in phase {:?}",
            repo.name_any(),
            repo.phase()
        ))),
    }
}

/// True when the repo's access artifact exists in the backup's namespace
async fn repo_prepared(
    client: &dyn BackupClient,
    repo: &BackupRepo,
    namespace: &str,
) -> Result<bool, BackupError> {
    if !repo.is_prepared() {
        return Ok(false);
    }
    let Some(status) = &repo.status else {
        return Ok(false);
    };
    match repo.spec.access_method {
        AccessMethod::Mount => match &status.backup_pvc_name {
            Some(pvc) => client.pvc_exists(pvc, namespace).await,
            None => Ok(false),
        },
        AccessMethod::Tool => match &status.tool_config_secret_name {
            Some(secret) => Ok(client.get_secret(secret, namespace).await?.is_some()),
            None => Ok(false),
        },
    }
}

async fn validate_continuous(
    client: &dyn BackupClient,
    backup: &Backup,
    method: &BackupMethod,
) -> Result<(), BackupError> {
    let Some(schedule_name) = backup.labels().get(LABEL_BACKUP_SCHEDULE) else {
        return Err(BackupError::fatal(
            "continuous backup is only allowed to be created by backupSchedule",
        ));
    };
    let namespace = backup.namespace().unwrap_or_default();
    let schedule = client
        .get_backup_schedule(schedule_name, &namespace)
        .await?
        .ok_or_else(|| {
            BackupError::fatal(format!(
                "create continuous backup by failed backupschedule {namespace}/{schedule_name}"
            ))
        })?;
    if !schedule.is_available() {
        return Err(BackupError::fatal(format!(
            "create continuous backup by failed backupschedule {namespace}/{schedule_name}"
        )));
    }
    if schedule.schedule_for(&method.name).is_none() {
        return Err(BackupError::fatal(format!(
            "backupschedule {namespace}/{schedule_name} does not schedule method {}",
            method.name
        )));
    }
    Ok(())
}

/// Resolve everything a Backup references into a working Request.
///
/// Validation order: policy, method, mode, ActionSet and parameters,
/// encryption, repository, type-specific checks, targets.
pub async fn build_request(
    client: &dyn BackupClient,
    backup: &Backup,
) -> Result<Request, BackupError> {
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
    let policy_name = &backup.spec.backup_policy_name;

    let policy = client
        .get_backup_policy(policy_name, &namespace)
        .await?
        .ok_or_else(|| {
            BackupError::requeue(format!("backupPolicy {namespace}/{policy_name} not found"))
        })?;
    if !policy.is_available() {
        return Err(BackupError::fatal(format!(
            "phase of backupPolicy {policy_name:?} is Unavailable"
        )));
    }

    let method = require_method(&policy, backup)?;
    check_mode(&method)?;

    let (action_set, backup_type) = match method.action_set() {
        Some(name) => {
            let action_set = client
                .get_action_set(name)
                .await?
                .ok_or_else(|| BackupError::requeue(format!("actionSet {name} not found")))?;
            action_set
                .spec
                .validate_parameters(&backup.spec.parameters)
                .map_err(|e| {
                    BackupError::fatal(format!(
                        "fails to validate parameters with actionset {name}: {e}"
                    ))
                })?;
            let backup_type = action_set.spec.backup_type;
            (Some(action_set), backup_type)
        }
        None => (None, BackupType::Full),
    };

    check_encryption(client, &policy).await?;

    let (repo, prepared) = if method.is_snapshot() {
        (None, true)
    } else {
        let repo = bind_repo(client, backup, &policy).await?;
        let prepared = repo_prepared(client, &repo, &namespace).await?;
        (Some(repo), prepared)
    };

    let lineage = match backup_type {
        BackupType::Incremental => Some(
            resolve_lineage(
                client,
                backup,
                &policy,
                &method,
                repo.as_ref().map(|r| r.name_any()).as_deref(),
            )
            .await?,
        ),
        BackupType::Continuous => {
            validate_continuous(client, backup, &method).await?;
            None
        }
        BackupType::Full | BackupType::Selective => None,
    };

    let target_spec = select_target_spec(&policy, &method)?;
    let targets = resolve_targets(
        client,
        backup,
        &policy,
        lineage.as_ref().map(|l| &l.parent),
        &target_spec,
        backup_type,
    )
    .await?;

    debug!(
        backup = %backup.name_any(),
        method = %method.name,
        %backup_type,
        targets = targets.len(),
        "built backup request"
    );

    Ok(Request {
        backup: backup.clone(),
        status: backup.status.clone().unwrap_or_default(),
        policy,
        method,
        action_set,
        backup_type,
        repo,
        repo_prepared: prepared,
        lineage,
        target_spec,
        targets,
    })
}
