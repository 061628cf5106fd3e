//! Action execution
//!
//! Each action is one unit of work against one target pod. Executing an
//! action is create-or-observe: the workload name is derived from
//! (backup, action, pod), so repeated passes find the workload an earlier
//! pass created instead of starting a new one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar as K8sEnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use stratum_common::crd::{
    AccessMethod, ActionPhase, ActionStatus, ActionType, BackupType, EncryptionConfig, EnvVar,
    ExecActionSpec, JobActionSpec, TargetVolumeInfo, TimeRange,
};

use stratum_common::kube_utils::deterministic_hash;

use crate::error::BackupError;
use crate::snapshot::{SnapshotProvider, VolumeSnapshot};
use crate::target::TargetPod;

/// Annotation a backup tool writes on its Job with the size of the data it stored
pub const ANNOTATION_TOTAL_SIZE: &str = "dataprotection.stratum.dev/total-size";
/// Annotation with the RFC 3339 start of the recoverable time range
pub const ANNOTATION_TIME_RANGE_START: &str = "dataprotection.stratum.dev/time-range-start";
/// Annotation with the RFC 3339 end of the recoverable time range
pub const ANNOTATION_TIME_RANGE_END: &str = "dataprotection.stratum.dev/time-range-end";

/// Mount path of the backup repository volume inside backup workloads
pub const REPO_MOUNT_PATH: &str = "/backupdata";
/// Mount path of the repository tool configuration
pub const TOOL_CONFIG_MOUNT_PATH: &str = "/etc/datasafed";

const MAX_NAME_LEN: usize = 63;
const JOB_BACKOFF_LIMIT: i32 = 3;

/// What an action runs
#[derive(Clone, Debug, PartialEq)]
pub enum ActionKind {
    /// A Job running a tool image
    Job(JobActionSpec),
    /// A command run inside the target pod's container
    Exec(ExecActionSpec),
    /// A long-running single replica StatefulSet (continuous backups)
    StatefulSet(JobActionSpec),
    /// CSI snapshots of the target pod's volumes
    Snapshot,
}

impl ActionKind {
    /// How the action is recorded in status
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Job(_) | Self::Exec(_) => ActionType::Job,
            Self::StatefulSet(_) => ActionType::StatefulSet,
            Self::Snapshot => ActionType::Snapshot,
        }
    }
}

/// One executable action bound to one target pod
#[derive(Clone, Debug, PartialEq)]
pub struct BackupAction {
    /// Action name, unique per target pod
    pub name: String,
    /// Pod the action runs against
    pub target_pod: TargetPod,
    /// Container of the target pod exec actions default to
    pub container: Option<String>,
    /// Service account override from the target
    pub service_account: Option<String>,
    /// What to run
    pub kind: ActionKind,
}

impl BackupAction {
    /// A fresh status entry for this action
    pub fn new_status(&self) -> ActionStatus {
        ActionStatus {
            name: self.name.clone(),
            target_pod_name: self.target_pod.name.clone(),
            phase: ActionPhase::New,
            action_type: self.kind.action_type(),
            ..Default::default()
        }
    }
}

/// Where backup workloads reach the repository
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RepoAccess {
    /// BackupRepo name
    pub name: String,
    /// Mount or Tool
    pub access_method: AccessMethod,
    /// PVC to mount (Mount access)
    pub pvc_name: Option<String>,
    /// Secret with tool configuration (Tool access)
    pub tool_config_secret: Option<String>,
}

/// Everything an executor needs beyond the action itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionContext {
    /// Backup name
    pub backup_name: String,
    /// Backup namespace; workloads are created here
    pub namespace: String,
    /// Backup type
    pub backup_type: BackupType,
    /// Path of this backup inside the repository
    pub backup_path: Option<String>,
    /// Repository access
    pub repo: Option<RepoAccess>,
    /// Parent backup of an incremental backup
    pub parent_backup_name: Option<String>,
    /// Base backup of an incremental backup
    pub base_backup_name: Option<String>,
    /// ActionSet, method and user environment in that precedence order
    pub env: Vec<EnvVar>,
    /// Labels stamped on every workload
    pub labels: BTreeMap<String, String>,
    /// Default service account for workloads
    pub service_account: String,
    /// Image for exec-action Jobs
    pub executor_image: String,
    /// activeDeadlineSeconds for Jobs
    pub deadline: Option<Duration>,
    /// Volumes of the target pod to back up
    pub target_volumes: Option<TargetVolumeInfo>,
    /// Encryption settings passed to the backup tool
    pub encryption: Option<EncryptionConfig>,
}

/// Runs one action and reports its status.
///
/// Implementations must be idempotent for the same (action, target pod).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Create the action's workload if needed and observe its phase
    async fn execute(
        &self,
        ctx: &ActionContext,
        action: &BackupAction,
    ) -> Result<ActionStatus, BackupError>;
}

/// Kubernetes-safe name, shortened with a hash suffix when too long
pub fn workload_name(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if joined.len() <= MAX_NAME_LEN {
        return joined;
    }
    let digest = deterministic_hash(&joined);
    let suffix = &digest[..8];
    let keep = MAX_NAME_LEN - suffix.len() - 1;
    let head = joined[..keep].trim_end_matches('-');
    format!("{head}-{suffix}")
}

fn env(name: &str, value: impl Into<String>) -> K8sEnvVar {
    K8sEnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment exported to every backup workload
pub fn workload_env(ctx: &ActionContext, action: &BackupAction) -> Vec<K8sEnvVar> {
    let mut vars = vec![
        env("DP_BACKUP_NAME", ctx.backup_name.clone()),
        env("DP_TARGET_POD_NAME", action.target_pod.name.clone()),
        env("DP_BACKUP_TYPE", ctx.backup_type.to_string()),
    ];
    if let Some(path) = &ctx.backup_path {
        let base = match ctx.repo.as_ref().map(|r| r.access_method) {
            Some(AccessMethod::Mount) => format!("{REPO_MOUNT_PATH}{path}"),
            _ => path.clone(),
        };
        vars.push(env("DP_BACKUP_BASE_PATH", base));
    }
    if let Some(parent) = &ctx.parent_backup_name {
        vars.push(env("DP_PARENT_BACKUP_NAME", parent.clone()));
    }
    if let Some(base) = &ctx.base_backup_name {
        vars.push(env("DP_BASE_BACKUP_NAME", base.clone()));
    }
    if let Some(enc) = &ctx.encryption {
        vars.push(env("DP_ENCRYPTION_ALGORITHM", enc.algorithm.clone()));
        vars.push(K8sEnvVar {
            name: "DP_ENCRYPTION_KEY".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: enc.pass_phrase_secret_key_ref.name.clone(),
                    key: enc.pass_phrase_secret_key_ref.key.clone(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    for var in &ctx.env {
        vars.retain(|v| v.name != var.name);
        vars.push(env(&var.name, var.value.clone()));
    }
    vars
}

fn repo_volumes(ctx: &ActionContext) -> (Vec<Volume>, Vec<VolumeMount>) {
    let Some(repo) = &ctx.repo else {
        return (vec![], vec![]);
    };
    match (repo.access_method, &repo.pvc_name, &repo.tool_config_secret) {
        (AccessMethod::Mount, Some(pvc), _) => (
            vec![Volume {
                name: "dp-backup-data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.clone(),
                    read_only: None,
                }),
                ..Default::default()
            }],
            vec![VolumeMount {
                name: "dp-backup-data".to_string(),
                mount_path: REPO_MOUNT_PATH.to_string(),
                ..Default::default()
            }],
        ),
        (AccessMethod::Tool, _, Some(secret)) => (
            vec![Volume {
                name: "dp-tool-config".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            vec![VolumeMount {
                name: "dp-tool-config".to_string(),
                mount_path: TOOL_CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }],
        ),
        _ => (vec![], vec![]),
    }
}

/// Mount the target pod's data volumes when the job runs on its node
fn target_data_volumes(ctx: &ActionContext, pod: &TargetPod) -> (Vec<Volume>, Vec<VolumeMount>) {
    let Some(info) = &ctx.target_volumes else {
        return (vec![], vec![]);
    };
    let mut volumes = vec![];
    let mut mounts = vec![];
    for volume in &info.volumes {
        let Some(claim) = pod.claims.get(volume) else {
            continue;
        };
        let name = format!("dp-{volume}");
        volumes.push(Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: Some(true),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name,
            mount_path: info
                .volume_mounts
                .get(volume)
                .cloned()
                .unwrap_or_else(|| format!("/data/{volume}")),
            read_only: Some(true),
            ..Default::default()
        });
    }
    (volumes, mounts)
}

fn pod_template(
    ctx: &ActionContext,
    action: &BackupAction,
    image: String,
    command: Vec<String>,
    pin_to_node: bool,
    restart_policy: &str,
) -> PodTemplateSpec {
    let (mut volumes, mut mounts) = repo_volumes(ctx);
    if pin_to_node {
        let (v, m) = target_data_volumes(ctx, &action.target_pod);
        volumes.extend(v);
        mounts.extend(m);
    }
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(ctx.labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            restart_policy: Some(restart_policy.to_string()),
            service_account_name: Some(
                action
                    .service_account
                    .clone()
                    .unwrap_or_else(|| ctx.service_account.clone()),
            ),
            node_name: pin_to_node
                .then(|| action.target_pod.node_name.clone())
                .flatten(),
            containers: vec![Container {
                name: "backup".to_string(),
                image: Some(image),
                command: Some(command),
                env: Some(workload_env(ctx, action)),
                volume_mounts: (!mounts.is_empty()).then_some(mounts),
                ..Default::default()
            }],
            volumes: (!volumes.is_empty()).then_some(volumes),
            ..Default::default()
        }),
    }
}

/// Name of the Job or StatefulSet backing an action
pub fn action_workload_name(ctx: &ActionContext, action: &BackupAction) -> String {
    match action.kind {
        ActionKind::StatefulSet(_) => workload_name(&[&ctx.backup_name]),
        _ => workload_name(&[&ctx.backup_name, &action.name, &action.target_pod.name]),
    }
}

/// Build the Job for a job or exec action
pub fn build_job(ctx: &ActionContext, action: &BackupAction) -> Option<Job> {
    let (template, deadline) = match &action.kind {
        ActionKind::Job(spec) => (
            pod_template(
                ctx,
                action,
                spec.image.clone(),
                spec.command.clone(),
                spec.run_on_target_pod_node,
                "Never",
            ),
            ctx.deadline.map(|d| d.as_secs() as i64),
        ),
        ActionKind::Exec(spec) => {
            let mut command = vec![
                "kubectl".to_string(),
                "exec".to_string(),
                "-n".to_string(),
                ctx.namespace.clone(),
                action.target_pod.name.clone(),
            ];
            if let Some(container) = spec.container.as_ref().or(action.container.as_ref()) {
                command.extend(["-c".to_string(), container.clone()]);
            }
            command.push("--".to_string());
            command.extend(spec.command.iter().cloned());
            (
                pod_template(ctx, action, ctx.executor_image.clone(), command, false, "Never"),
                spec.timeout_seconds.or(ctx.deadline.map(|d| d.as_secs() as i64)),
            )
        }
        ActionKind::StatefulSet(_) | ActionKind::Snapshot => return None,
    };

    Some(Job {
        metadata: ObjectMeta {
            name: Some(action_workload_name(ctx, action)),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(JOB_BACKOFF_LIMIT),
            active_deadline_seconds: deadline,
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the single-replica StatefulSet for a continuous backup
pub fn build_statefulset(ctx: &ActionContext, action: &BackupAction) -> Option<StatefulSet> {
    let ActionKind::StatefulSet(spec) = &action.kind else {
        return None;
    };
    let template = pod_template(
        ctx,
        action,
        spec.image.clone(),
        spec.command.clone(),
        spec.run_on_target_pod_node,
        "Always",
    );
    Some(StatefulSet {
        metadata: ObjectMeta {
            name: Some(action_workload_name(ctx, action)),
            namespace: Some(ctx.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(ctx.labels.clone()),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Map a Job's conditions and reporting annotations onto an action status
pub fn job_action_status(action: &BackupAction, job: &Job) -> ActionStatus {
    let mut status = action.new_status();
    status.workload_name = Some(job.name_any());
    status.phase = ActionPhase::Running;

    let job_status = job.status.as_ref();
    status.start_timestamp = job_status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);

    let condition = |type_: &str| {
        job_status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == type_ && c.status == "True"))
    };
    if let Some(complete) = condition("Complete") {
        status.phase = ActionPhase::Completed;
        status.completion_timestamp = job_status
            .and_then(|s| s.completion_time.as_ref())
            .or(complete.last_transition_time.as_ref())
            .map(|t| t.0);
    } else if let Some(failed) = condition("Failed") {
        status.phase = ActionPhase::Failed;
        status.completion_timestamp = failed.last_transition_time.as_ref().map(|t| t.0);
        status.failure_reason = Some(
            failed
                .message
                .clone()
                .or_else(|| failed.reason.clone())
                .unwrap_or_else(|| format!("job {} failed", job.name_any())),
        );
    }

    let annotations = job.annotations();
    status.total_size = annotations.get(ANNOTATION_TOTAL_SIZE).cloned();
    let start = parse_time(annotations.get(ANNOTATION_TIME_RANGE_START));
    let end = parse_time(annotations.get(ANNOTATION_TIME_RANGE_END));
    if start.is_some() || end.is_some() {
        status.time_range = Some(TimeRange { start, end });
    }
    status
}

/// Claims of the target pod to snapshot: the listed volumes, else all of them
pub fn snapshot_claims(ctx: &ActionContext, pod: &TargetPod) -> Vec<(String, String)> {
    match &ctx.target_volumes {
        Some(info) if !info.volumes.is_empty() => info
            .volumes
            .iter()
            .filter_map(|v| pod.claims.get(v).map(|c| (v.clone(), c.clone())))
            .collect(),
        _ => pod.claims.clone().into_iter().collect(),
    }
}

/// Executor creating Jobs, StatefulSets and VolumeSnapshots
pub struct KubeActionExecutor {
    client: Client,
    snapshots: Arc<dyn SnapshotProvider>,
}

impl KubeActionExecutor {
    /// Create an executor
    pub fn new(client: Client, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self { client, snapshots }
    }

    async fn run_job(&self, ctx: &ActionContext, action: &BackupAction) -> Result<ActionStatus, BackupError> {
        let Some(desired) = build_job(ctx, action) else {
            return Err(BackupError::fatal(format!("action {} is not job backed", action.name)));
        };
        let name = desired.name_any();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &ctx.namespace);
        let job = match api.get_opt(&name).await? {
            Some(job) => job,
            None => {
                info!(job = %name, action = %action.name, pod = %action.target_pod.name, "creating backup job");
                match api.create(&PostParams::default(), &desired).await {
                    Ok(job) => job,
                    Err(kube::Error::Api(e)) if e.code == 409 => api.get(&name).await?,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(job_action_status(action, &job))
    }

    async fn run_statefulset(
        &self,
        ctx: &ActionContext,
        action: &BackupAction,
    ) -> Result<ActionStatus, BackupError> {
        let Some(desired) = build_statefulset(ctx, action) else {
            return Err(BackupError::fatal(format!("action {} is not a statefulset", action.name)));
        };
        let name = desired.name_any();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ctx.namespace);
        if api.get_opt(&name).await?.is_none() {
            info!(statefulset = %name, "creating continuous backup statefulset");
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        let mut status = action.new_status();
        status.phase = ActionPhase::Running;
        status.workload_name = Some(name);
        Ok(status)
    }

    async fn run_snapshot(&self, ctx: &ActionContext, action: &BackupAction) -> Result<ActionStatus, BackupError> {
        let mut status = action.new_status();
        let claims = snapshot_claims(ctx, &action.target_pod);
        if claims.is_empty() {
            status.phase = ActionPhase::Failed;
            status.failure_reason = Some(format!(
                "no persistent volume claims to snapshot on pod {}",
                action.target_pod.name
            ));
            return Ok(status);
        }

        let mut ready = true;
        for (volume, claim) in claims {
            let name = workload_name(&[&ctx.backup_name, &volume, &action.target_pod.name]);
            let desired = VolumeSnapshot::for_claim(&name, &ctx.namespace, claim, &ctx.labels);
            let current = self.snapshots.ensure_snapshot(&desired).await?;
            status.volume_snapshots.push(name.clone());
            if let Some(err) = current.error_message() {
                status.phase = ActionPhase::Failed;
                status.failure_reason = Some(format!("volume snapshot {name} failed: {err}"));
                return Ok(status);
            }
            ready &= current.is_ready();
            if status.total_size.is_none() {
                status.total_size = current.restore_size().map(str::to_string);
            }
        }
        if ready {
            status.phase = ActionPhase::Completed;
            status.completion_timestamp = Some(Utc::now());
        } else {
            status.phase = ActionPhase::Running;
        }
        debug!(action = %action.name, phase = ?status.phase, "snapshot action observed");
        Ok(status)
    }
}

#[async_trait]
impl ActionExecutor for KubeActionExecutor {
    async fn execute(
        &self,
        ctx: &ActionContext,
        action: &BackupAction,
    ) -> Result<ActionStatus, BackupError> {
        match action.kind {
            ActionKind::Job(_) | ActionKind::Exec(_) => self.run_job(ctx, action).await,
            ActionKind::StatefulSet(_) => self.run_statefulset(ctx, action).await,
            ActionKind::Snapshot => self.run_snapshot(ctx, action).await,
        }
    }
}
