//! Backup controller
//!
//! Dispatches each Backup on its phase:
//!
//! - **New**: build the request, label and annotate the Backup, add the
//!   finalizer, record targets and actions, move to Running
//! - **Running**: execute actions in order per target pod and aggregate
//! - **Completed**: remove the workloads that produced the backup
//! - **Deleting**: run the deletion cascade
//! - **Failed**: terminal, except for Continuous backups which retry
//!
//! A fatal error moves the Backup to Failed with the error text recorded.
//! Any other error is returned to the runtime and retried with per-object
//! exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use stratum_common::crd::{ActionPhase, Backup, BackupPhase, BackupStatus, BackupType};
use stratum_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use stratum_common::metrics;
use stratum_common::{
    ANNOTATION_SKIP_RECONCILIATION, DATA_PROTECTION_FINALIZER, LABEL_APP_INSTANCE,
    LABEL_BACKUP_SCHEDULE, LABEL_BACKUP_TYPE,
};

use crate::action::{ActionExecutor, KubeActionExecutor};
use crate::annotations::backup_annotations;
use crate::client::{BackupClient, KubeBackupClient, TargetCluster};
use crate::config::EngineConfig;
use crate::deletion::{handle_deleting, KubeRepositoryDeleter, RepositoryDeleter};
use crate::error::BackupError;
use crate::request::{build_request, Request};
use crate::snapshot::{KubeSnapshotProvider, SnapshotProvider};
use crate::status::{
    aggregate, complete_all_actions, compute_expiration, mark_completed, merge_action_status,
    propagate_totals, Aggregate,
};
use crate::target::workload_labels;
use crate::{REQUEUE_IMMEDIATE_SECS, REQUEUE_RUNNING_SECS};

/// Name the controller reports events under
pub const CONTROLLER_NAME: &str = "stratum-backup-controller";

/// Failure reason when an action failed and nothing is left running
pub const FAILED_ACTIONS_REASON: &str =
    "there are failed actions, you can obtain the more informations in the status.actions";

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared context for the Backup controller
pub struct Context {
    /// Kubernetes access
    pub client: Arc<dyn BackupClient>,
    /// Runs backup actions
    pub executor: Arc<dyn ActionExecutor>,
    /// Volume snapshot access
    pub snapshots: Arc<dyn SnapshotProvider>,
    /// Deletes repository files
    pub deleter: Arc<dyn RepositoryDeleter>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Engine configuration
    pub config: EngineConfig,
    /// Current time
    pub clock: Clock,
    /// Consecutive transient failures per Backup, reset on success
    retries: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: EngineConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn BackupClient>,
        executor: Arc<dyn ActionExecutor>,
        snapshots: Arc<dyn SnapshotProvider>,
        deleter: Arc<dyn RepositoryDeleter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            executor,
            snapshots,
            deleter,
            events,
            config: EngineConfig::default(),
            clock: Arc::new(Utc::now),
            retries: DashMap::new(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: EngineConfig,
    backup_client: Option<Arc<dyn BackupClient>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    deleter: Option<Arc<dyn RepositoryDeleter>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            backup_client: None,
            executor: None,
            snapshots: None,
            deleter: None,
            events: None,
        }
    }

    /// Override the Kubernetes access layer
    pub fn backup_client(mut self, client: Arc<dyn BackupClient>) -> Self {
        self.backup_client = Some(client);
        self
    }

    /// Override the action executor
    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override the repository deleter
    pub fn deleter(mut self, deleter: Arc<dyn RepositoryDeleter>) -> Self {
        self.deleter = Some(deleter);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let backup_client = self
            .backup_client
            .unwrap_or_else(|| Arc::new(KubeBackupClient::new(client.clone())));
        let snapshots = self
            .snapshots
            .unwrap_or_else(|| Arc::new(KubeSnapshotProvider::new(client.clone())));
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(KubeActionExecutor::new(client.clone(), snapshots.clone()))
        });
        let deleter = self.deleter.unwrap_or_else(|| {
            Arc::new(KubeRepositoryDeleter::new(
                client.clone(),
                backup_client.clone(),
                self.config.clone(),
            ))
        });
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME)));
        Context {
            client: backup_client,
            executor,
            snapshots,
            deleter,
            events,
            config: self.config,
            clock: Arc::new(Utc::now),
            retries: DashMap::new(),
        }
    }
}

/// What a reconcile pass does for a Backup
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Skip annotation present
    Skip,
    /// deletionTimestamp set: move to Deleting first
    MarkDeleting,
    /// Start the backup
    New,
    /// Advance running actions
    Running,
    /// Clean up workloads of a completed backup
    Completed,
    /// Run the deletion cascade
    Deleting,
    /// Terminal, nothing to do
    Idle,
}

fn labeled_type(backup: &Backup) -> Option<BackupType> {
    backup
        .labels()
        .get(LABEL_BACKUP_TYPE)
        .and_then(|t| t.parse().ok())
}

/// Decide what this pass does. Pure so the dispatch can be tested directly.
pub fn next_step(backup: &Backup) -> Step {
    let skip = backup
        .annotations()
        .get(ANNOTATION_SKIP_RECONCILIATION)
        .is_some_and(|v| v == "true");
    if skip {
        return Step::Skip;
    }

    let phase = backup.phase();
    if backup.meta().deletion_timestamp.is_some() && phase != BackupPhase::Deleting {
        return Step::MarkDeleting;
    }

    match phase {
        BackupPhase::New => Step::New,
        BackupPhase::Running => Step::Running,
        BackupPhase::Completed => Step::Completed,
        BackupPhase::Deleting => Step::Deleting,
        BackupPhase::Failed => {
            if labeled_type(backup) != Some(BackupType::Continuous) {
                return Step::Idle;
            }
            let started = backup
                .status
                .as_ref()
                .is_some_and(|s| s.start_timestamp.is_some());
            if started {
                Step::Running
            } else {
                Step::New
            }
        }
    }
}

/// Phase transitions the controller may commit. Staying in a phase is always allowed.
pub fn is_allowed_transition(from: BackupPhase, to: BackupPhase) -> bool {
    use BackupPhase::*;
    from == to
        || matches!(
            (from, to),
            (New, Running)
                | (New, Failed)
                | (New, Deleting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Deleting)
                | (Completed, Deleting)
                | (Failed, Running)
                | (Failed, Completed)
                | (Failed, Deleting)
        )
}

/// Commit a new status if it differs from the observed one
async fn commit_status(
    ctx: &Context,
    backup: &Backup,
    status: &BackupStatus,
) -> Result<Backup, BackupError> {
    let from = backup.phase();
    let to = status.phase();
    if !is_allowed_transition(from, to) {
        return Err(BackupError::Common(stratum_common::Error::internal_with_context(
            backup.name_any(),
            format!("illegal phase transition {from} -> {to}"),
        )));
    }
    if backup.status.as_ref() == Some(status) {
        debug!(backup = %backup.name_any(), "status unchanged, skipping update");
        return Ok(backup.clone());
    }

    let updated = ctx.client.patch_backup_status(backup, status).await?;
    if from != to {
        info!(backup = %backup.name_any(), %from, %to, "backup phase changed");
        metrics::record_transition(from.as_str(), to.as_str());
    }
    Ok(updated)
}

/// Reconcile a Backup
#[instrument(
    skip(backup, ctx),
    fields(backup = %backup.name_any(), namespace = %backup.namespace().unwrap_or_default())
)]
pub async fn reconcile(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, BackupError> {
    let started = Instant::now();
    let phase = backup.phase();
    let step = next_step(&backup);
    debug!(?step, %phase, "reconciling backup");

    let result = match run_step(step, &backup, &ctx).await {
        Err(e) if e.is_fatal() && matches!(step, Step::New | Step::Running) => {
            let status = backup.status.clone().unwrap_or_default();
            fail_backup(&backup, &ctx, status, &e.to_string()).await
        }
        other => other,
    };

    metrics::record_reconcile(phase.as_str(), result.is_ok(), started.elapsed().as_secs_f64());
    match &result {
        Ok(_) => {
            ctx.retries.remove(&retry_key(&backup));
        }
        Err(e) => metrics::record_error(e.error_type()),
    }
    result
}

async fn run_step(step: Step, backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    match step {
        Step::Skip => {
            debug!("skip-reconciliation annotation set");
            Ok(Action::await_change())
        }
        Step::MarkDeleting => mark_deleting(backup, ctx).await,
        Step::New => handle_new(backup, ctx).await,
        Step::Running => handle_running(backup, ctx).await,
        Step::Completed => handle_completed(backup, ctx).await,
        Step::Deleting => handle_deleting(backup, ctx).await,
        Step::Idle => Ok(Action::await_change()),
    }
}

fn retry_key(backup: &Backup) -> String {
    format!("{}/{}", backup.namespace().unwrap_or_default(), backup.name_any())
}

/// Requeue with exponential backoff per Backup
pub fn error_policy(backup: Arc<Backup>, error: &BackupError, ctx: Arc<Context>) -> Action {
    let key = retry_key(&backup);
    let attempt = {
        let mut entry = ctx.retries.entry(key).or_insert(0);
        let attempt = *entry;
        *entry = attempt.saturating_add(1);
        attempt
    };
    let delay = ctx.config.backoff_for(attempt);
    if error.is_conflict() {
        debug!(backup = %backup.name_any(), "backup changed during reconcile, retrying");
    } else {
        warn!(
            backup = %backup.name_any(),
            error = %error,
            attempt,
            delay_secs = delay.as_secs(),
            "reconcile failed, retrying"
        );
    }
    Action::requeue(delay)
}

async fn mark_deleting(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let mut status = backup.status.clone().unwrap_or_default();
    status.phase = Some(BackupPhase::Deleting);
    commit_status(ctx, backup, &status).await?;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)))
}

/// Move a Backup to Failed on top of `status`. Expiration is still computed
/// so failed backups are garbage collected.
async fn fail_backup(
    backup: &Backup,
    ctx: &Context,
    mut status: BackupStatus,
    reason: &str,
) -> Result<Action, BackupError> {
    let now = ctx.now();
    status.phase = Some(BackupPhase::Failed);
    status.failure_reason = Some(reason.to_string());
    let backup_type = labeled_type(backup).unwrap_or_default();
    status.expiration = compute_expiration(backup, &status, backup_type, now).unwrap_or(None);

    warn!(backup = %backup.name_any(), reason, "backup failed");
    metrics::record_error(metrics::ErrorType::Fatal);
    commit_status(ctx, backup, &status).await?;
    ctx.events
        .publish(
            &backup.object_ref(&()),
            EventType::Warning,
            reasons::BACKUP_FAILED,
            actions::BACKUP,
            Some(reason.to_string()),
        )
        .await;
    Ok(Action::await_change())
}

async fn target_cluster(ctx: &Context, backup: &Backup) -> Result<Option<TargetCluster>, BackupError> {
    let Some(instance) = backup.labels().get(LABEL_APP_INSTANCE) else {
        return Ok(None);
    };
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
    ctx.client.get_target_cluster(instance, &namespace).await
}

async fn handle_new(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let mut request = build_request(ctx.client.as_ref(), backup).await?;

    let instance_labels = request.backup_labels(None);
    let cluster = match instance_labels.get(LABEL_APP_INSTANCE) {
        Some(instance) => {
            ctx.client
                .get_target_cluster(instance, &request.namespace())
                .await?
        }
        None => None,
    };
    let labels = request.backup_labels(cluster.as_ref().and_then(|c| c.uid.as_deref()));
    let annotations = backup_annotations(
        ctx.client.as_ref(),
        ctx.config.encryptor.as_ref(),
        backup,
        cluster.as_ref(),
    )
    .await?;
    let mut finalizers = backup.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == DATA_PROTECTION_FINALIZER) {
        finalizers.push(DATA_PROTECTION_FINALIZER.to_string());
    }

    let observed = if &labels != backup.labels()
        || &annotations != backup.annotations()
        || finalizers.as_slice() != backup.finalizers()
    {
        ctx.client
            .patch_backup_metadata(backup, &labels, &annotations, &finalizers)
            .await?
    } else {
        backup.clone()
    };

    if !request.repo_prepared {
        info!(
            backup = %backup.name_any(),
            repo = %request.repo.as_ref().map(|r| r.name_any()).unwrap_or_default(),
            "waiting for backup repo to be prepared in this namespace"
        );
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)));
    }

    let now = ctx.now();
    request.backup = observed;
    request.init_running_status(now)?;
    request.status.expiration =
        compute_expiration(&request.backup, &request.status, request.backup_type, now)?;
    commit_status(ctx, &request.backup, &request.status).await?;

    info!(
        backup = %backup.name_any(),
        backup_type = %request.backup_type,
        actions = request.status.actions.len(),
        "backup started"
    );
    Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)))
}

/// A Continuous backup ends when its cluster goes away or is stopped, or
/// when its schedule no longer enables the method.
async fn continuous_backup_finished(
    ctx: &Context,
    backup: &Backup,
    cluster: Option<&TargetCluster>,
) -> Result<bool, BackupError> {
    if cluster.is_some_and(|c| c.deleting || c.is_stopped()) {
        return Ok(true);
    }
    let Some(schedule_name) = backup.labels().get(LABEL_BACKUP_SCHEDULE) else {
        return Ok(false);
    };
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
    let enabled = ctx
        .client
        .get_backup_schedule(schedule_name, &namespace)
        .await?
        .and_then(|s| s.schedule_for(&backup.spec.backup_method).map(|p| p.is_enabled()))
        .unwrap_or(false);
    Ok(!enabled)
}

async fn finish_continuous(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let now = ctx.now();
    let mut status = backup.status.clone().unwrap_or_default();
    complete_all_actions(&mut status, now);
    mark_completed(&mut status, now);
    status.failure_reason = None;
    status.expiration = compute_expiration(backup, &status, BackupType::Continuous, now)?;
    commit_status(ctx, backup, &status).await?;
    ctx.events
        .publish(
            &backup.object_ref(&()),
            EventType::Normal,
            reasons::CONTINUOUS_BACKUP_STOPPED,
            actions::BACKUP,
            Some("continuous backup stopped".to_string()),
        )
        .await;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)))
}

/// Execute actions in order per target pod. A pod's remaining actions wait
/// while an earlier one is still running or has failed.
async fn run_actions(request: &mut Request, ctx: &Context) -> Result<(), BackupError> {
    let action_ctx = request.action_context(&ctx.config);
    let mut blocked: Vec<String> = Vec::new();

    for action in request.build_actions()? {
        let pod = &action.target_pod.name;
        if blocked.contains(pod) {
            continue;
        }
        let settled = request
            .status
            .actions
            .iter()
            .find(|a| a.name == action.name && &a.target_pod_name == pod && a.phase.is_terminal())
            .cloned();
        let merged = match settled {
            Some(done) => done,
            None => {
                let observed = ctx.executor.execute(&action_ctx, &action).await?;
                merge_action_status(&mut request.status.actions, observed, ctx.now())
            }
        };

        if merged.phase == ActionPhase::Completed {
            propagate_totals(&mut request.status, &merged);
        } else {
            blocked.push(pod.clone());
        }
    }
    Ok(())
}

async fn handle_running(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let cluster = target_cluster(ctx, backup).await?;
    if cluster.as_ref().is_some_and(|c| c.restoring) {
        info!(backup = %backup.name_any(), "restore in progress, delaying backup");
        ctx.events
            .publish(
                &backup.object_ref(&()),
                EventType::Warning,
                reasons::RESTORE_IN_PROGRESS,
                actions::BACKUP,
                Some("backup job is delayed because restore is in progress".to_string()),
            )
            .await;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)));
    }

    if labeled_type(backup) == Some(BackupType::Continuous)
        && continuous_backup_finished(ctx, backup, cluster.as_ref()).await?
    {
        info!(backup = %backup.name_any(), "continuous backup finished");
        return finish_continuous(backup, ctx).await;
    }

    let mut request = build_request(ctx.client.as_ref(), backup).await?;
    if request.backup_type == BackupType::Continuous {
        request.status.encryption_config = request.policy.spec.encryption_config.clone();
    }
    if request.backup.phase() == BackupPhase::Failed {
        request.status.phase = Some(BackupPhase::Running);
        request.status.failure_reason = None;
    }

    run_actions(&mut request, ctx).await?;

    let now = ctx.now();
    match aggregate(&request.status.actions) {
        Aggregate::Waiting => {
            request.status.completion_timestamp = None;
            request.status.duration = None;
            request.status.expiration =
                compute_expiration(backup, &request.status, request.backup_type, now)?;
            commit_status(ctx, backup, &request.status).await?;
            Ok(Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)))
        }
        Aggregate::Failed => fail_backup(backup, ctx, request.status, FAILED_ACTIONS_REASON).await,
        Aggregate::Completed => {
            mark_completed(&mut request.status, now);
            request.status.expiration =
                compute_expiration(backup, &request.status, request.backup_type, now)?;
            commit_status(ctx, backup, &request.status).await?;
            ctx.events
                .publish(
                    &backup.object_ref(&()),
                    EventType::Normal,
                    reasons::CREATED_BACKUP,
                    actions::BACKUP,
                    Some("Completed backup".to_string()),
                )
                .await;
            info!(backup = %backup.name_any(), duration = ?request.status.duration, "backup completed");
            Ok(Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)))
        }
    }
}

async fn handle_completed(backup: &Backup, ctx: &Context) -> Result<Action, BackupError> {
    let labels = workload_labels(backup);
    let mut namespaces = vec![backup.namespace().ok_or(BackupError::MissingNamespace)?];
    if !namespaces.contains(&ctx.config.controller_namespace) {
        namespaces.push(ctx.config.controller_namespace.clone());
    }
    for namespace in namespaces {
        ctx.client.delete_workloads(&namespace, &labels).await?;
    }
    Ok(Action::await_change())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    use crate::action::MockActionExecutor;
    use crate::annotations::tests::account_secret;
    use crate::client::MockBackupClient;
    use crate::deletion::MockRepositoryDeleter;
    use crate::request::tests::{backup as new_backup, healthy_client, policy, target};
    use crate::request::BACKUP_DATA_ACTION;
    use crate::snapshot::MockSnapshotProvider;
    use stratum_common::crd::{
        ActionStatus, BackupStatusTarget, BackupSchedule, BackupSchedulePhase,
        BackupScheduleSpec, BackupScheduleStatus, DeletionPolicy, SchedulePolicy,
    };
    use stratum_common::crypto::Encryptor;
    use stratum_common::{LABEL_BACKUP_POLICY, LABEL_BACKUP_REPO};

    // =========================================================================
    // Test helpers
    // =========================================================================

    /// Records event reasons in publish order
    #[derive(Clone, Default)]
    pub(crate) struct EventCapture(Arc<Mutex<Vec<String>>>);

    impl EventCapture {
        pub(crate) fn reasons(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventPublisher for EventCapture {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.0.lock().unwrap().push(reason.to_string());
        }
    }

    /// Captures every committed status
    #[derive(Clone, Default)]
    struct StatusCapture(Arc<Mutex<Vec<BackupStatus>>>);

    impl StatusCapture {
        fn install(&self, client: &mut MockBackupClient) {
            let captured = self.0.clone();
            client.expect_patch_backup_status().returning(move |b, s| {
                captured.lock().unwrap().push(s.clone());
                let mut updated = b.clone();
                updated.status = Some(s.clone());
                Ok(updated)
            });
        }

        fn last(&self) -> BackupStatus {
            self.0.lock().unwrap().last().cloned().expect("no status committed")
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    const TEST_ENCRYPTION_KEY: &str = "test-key";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn context(
        client: MockBackupClient,
        executor: MockActionExecutor,
        events: &EventCapture,
        now: DateTime<Utc>,
    ) -> Arc<Context> {
        let mut ctx = Context::for_testing(
            Arc::new(client),
            Arc::new(executor),
            Arc::new(MockSnapshotProvider::new()),
            Arc::new(MockRepositoryDeleter::new()),
            Arc::new(events.clone()),
        );
        ctx.clock = Arc::new(move || now);
        ctx.config.encryptor = Some(Encryptor::new(TEST_ENCRYPTION_KEY));
        Arc::new(ctx)
    }

    fn healthy_cluster(client: &mut MockBackupClient, restoring: bool) {
        client.expect_get_target_cluster().returning(move |name, _| {
            Ok(Some(TargetCluster {
                name: name.to_string(),
                uid: Some("cluster-uid-1".to_string()),
                restoring,
                snapshot: Some(format!(r#"{{"kind":"Cluster","metadata":{{"name":"{name}"}}}}"#)),
                ..Default::default()
            }))
        });
        client.expect_list_secrets().returning(|_, _| {
            Ok(vec![account_secret(
                "pg-main-postgresql-root",
                &[(stratum_common::LABEL_APP_COMPONENT, "postgresql")],
                &[("username", "root"), ("password", "r00t")],
            )])
        });
    }

    /// A Full backup that has started on the given pods
    fn running_backup(pods: &[&str]) -> Backup {
        let mut b = new_backup("pg-basebackup");
        b.metadata.labels = Some(BTreeMap::from([
            (LABEL_BACKUP_TYPE.to_string(), "Full".to_string()),
            (LABEL_BACKUP_POLICY.to_string(), "pg-policy".to_string()),
            (LABEL_BACKUP_REPO.to_string(), "s3-repo".to_string()),
            (LABEL_APP_INSTANCE.to_string(), "pg-main".to_string()),
        ]));
        b.metadata.finalizers = Some(vec![DATA_PROTECTION_FINALIZER.to_string()]);
        let actions = pods
            .iter()
            .flat_map(|pod| {
                ["pre-backup-0", BACKUP_DATA_ACTION].map(|name| ActionStatus {
                    name: name.to_string(),
                    target_pod_name: pod.to_string(),
                    phase: ActionPhase::New,
                    ..Default::default()
                })
            })
            .collect();
        b.status = Some(BackupStatus {
            phase: Some(BackupPhase::Running),
            start_timestamp: Some(t(0)),
            backup_method: policy().spec.method("pg-basebackup").cloned(),
            backup_repo_name: Some("s3-repo".to_string()),
            path: Some("/pg/pg-main/pg-backup-1".to_string()),
            target: Some(BackupStatusTarget {
                target: target(),
                selected_target_pods: pods.iter().map(|p| p.to_string()).collect(),
            }),
            actions,
            ..Default::default()
        });
        b
    }

    pub(crate) fn deleting_backup(policy: DeletionPolicy) -> Backup {
        let mut b = running_backup(&["pg-main-0"]);
        b.spec.deletion_policy = policy;
        b.metadata.deletion_timestamp = Some(Time(t(100)));
        b.status.as_mut().unwrap().phase = Some(BackupPhase::Deleting);
        b
    }

    /// Executor that reports the given phase for (action, pod)
    fn executor_reporting(phases: Vec<(&'static str, &'static str, ActionPhase)>) -> MockActionExecutor {
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().returning(move |_, action| {
            let phase = phases
                .iter()
                .find(|(name, pod, _)| *name == action.name && *pod == action.target_pod.name)
                .map(|(_, _, phase)| *phase)
                .unwrap_or(ActionPhase::Running);
            Ok(ActionStatus {
                name: action.name.clone(),
                target_pod_name: action.target_pod.name.clone(),
                phase,
                failure_reason: (phase == ActionPhase::Failed).then(|| "exit code 1".to_string()),
                total_size: (phase == ActionPhase::Completed).then(|| "3Gi".to_string()),
                ..Default::default()
            })
        });
        executor
    }

    /// Available schedule for the archive-wal method
    fn wal_schedule(name: &str, enabled: bool) -> BackupSchedule {
        let mut s = BackupSchedule::new(
            name,
            BackupScheduleSpec {
                backup_policy_name: "pg-policy".to_string(),
                schedules: vec![SchedulePolicy {
                    backup_method: "archive-wal".to_string(),
                    enabled: Some(enabled),
                    ..Default::default()
                }],
            },
        );
        s.status = Some(BackupScheduleStatus {
            phase: BackupSchedulePhase::Available,
            message: None,
        });
        s
    }

    /// A Continuous backup whose data action is streaming on pg-main-0
    fn running_continuous_backup() -> Backup {
        let mut b = running_backup(&["pg-main-0"]);
        b.spec.backup_method = "archive-wal".to_string();
        let labels = b.metadata.labels.as_mut().unwrap();
        labels.insert(LABEL_BACKUP_TYPE.to_string(), "Continuous".to_string());
        labels.insert(LABEL_BACKUP_SCHEDULE.to_string(), "pg-schedule".to_string());
        let status = b.status.as_mut().unwrap();
        status.backup_method = policy().spec.method("archive-wal").cloned();
        status.actions = vec![ActionStatus {
            name: BACKUP_DATA_ACTION.to_string(),
            target_pod_name: "pg-main-0".to_string(),
            phase: ActionPhase::Running,
            start_timestamp: Some(t(0)),
            ..Default::default()
        }];
        b
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    #[rstest]
    #[case(None, None, false, Step::New)]
    #[case(Some(BackupPhase::Running), None, false, Step::Running)]
    #[case(Some(BackupPhase::Completed), None, false, Step::Completed)]
    #[case(Some(BackupPhase::Deleting), None, true, Step::Deleting)]
    #[case(Some(BackupPhase::Completed), None, true, Step::MarkDeleting)]
    #[case(Some(BackupPhase::Failed), Some("Full"), false, Step::Idle)]
    #[case(Some(BackupPhase::Failed), Some("Continuous"), false, Step::New)]
    fn test_next_step(
        #[case] phase: Option<BackupPhase>,
        #[case] backup_type: Option<&str>,
        #[case] deleting: bool,
        #[case] expected: Step,
    ) {
        let mut b = new_backup("pg-basebackup");
        if let Some(t) = backup_type {
            b.metadata.labels = Some(BTreeMap::from([(LABEL_BACKUP_TYPE.to_string(), t.to_string())]));
        }
        b.status = Some(BackupStatus {
            phase,
            ..Default::default()
        });
        if deleting {
            b.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        assert_eq!(next_step(&b), expected);
    }

    #[test]
    fn test_failed_continuous_with_start_resumes_running() {
        let mut b = running_backup(&["pg-main-0"]);
        b.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(LABEL_BACKUP_TYPE.to_string(), "Continuous".to_string());
        b.status.as_mut().unwrap().phase = Some(BackupPhase::Failed);
        assert_eq!(next_step(&b), Step::Running);
    }

    #[test]
    fn test_skip_annotation_wins() {
        let mut b = deleting_backup(DeletionPolicy::Delete);
        b.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_SKIP_RECONCILIATION.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(next_step(&b), Step::Skip);
    }

    #[rstest]
    #[case(BackupPhase::New, BackupPhase::Running, true)]
    #[case(BackupPhase::Running, BackupPhase::Completed, true)]
    #[case(BackupPhase::Completed, BackupPhase::Deleting, true)]
    #[case(BackupPhase::Failed, BackupPhase::Running, true)]
    #[case(BackupPhase::Completed, BackupPhase::Running, false)]
    #[case(BackupPhase::Deleting, BackupPhase::Running, false)]
    #[case(BackupPhase::Deleting, BackupPhase::Failed, false)]
    #[case(BackupPhase::Completed, BackupPhase::Failed, false)]
    fn test_transition_table(#[case] from: BackupPhase, #[case] to: BackupPhase, #[case] allowed: bool) {
        assert_eq!(is_allowed_transition(from, to), allowed);
    }

    // =========================================================================
    // Stories
    // =========================================================================

    /// Story: a fresh Backup is labeled, guarded by the finalizer and moved
    /// to Running with one New action per ActionSet step and target pod.
    #[tokio::test]
    async fn story_new_backup_starts_running() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let recorded = Arc::new(Mutex::new(Vec::<BTreeMap<String, String>>::new()));
        let patched = recorded.clone();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        client
            .expect_patch_backup_metadata()
            .withf(|_, labels, _, finalizers| {
                labels.get(stratum_common::LABEL_CLUSTER_UID).map(String::as_str)
                    == Some("cluster-uid-1")
                    && labels.get(LABEL_BACKUP_TYPE).map(String::as_str) == Some("Full")
                    && finalizers == [DATA_PROTECTION_FINALIZER.to_string()]
            })
            .times(1)
            .returning(move |b, labels, annotations, finalizers| {
                patched.lock().unwrap().push(annotations.clone());
                let mut updated = b.clone();
                updated.metadata.labels = Some(labels.clone());
                updated.metadata.annotations = Some(annotations.clone());
                updated.metadata.finalizers = Some(finalizers.to_vec());
                updated.metadata.resource_version = Some("101".to_string());
                Ok(updated)
            });
        statuses.install(&mut client);

        let ctx = context(client, MockActionExecutor::new(), &events, t(0));
        let action = reconcile(Arc::new(new_backup("pg-basebackup")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_IMMEDIATE_SECS)));

        let status = statuses.last();
        assert_eq!(status.phase, Some(BackupPhase::Running));
        assert_eq!(status.start_timestamp, Some(t(0)));
        assert_eq!(status.expiration, Some(t(7 * 86_400)));
        assert_eq!(status.actions.len(), 2);
        assert!(status.actions.iter().all(|a| a.target_pod_name == "pg-main-0"));

        let annotations = recorded.lock().unwrap().pop().expect("metadata not patched");
        assert_eq!(
            annotations[stratum_common::ANNOTATION_CLUSTER_SNAPSHOT],
            r#"{"kind":"Cluster","metadata":{"name":"pg-main"}}"#
        );
        let accounts: crate::annotations::SystemAccounts = serde_json::from_str(
            &annotations[stratum_common::ANNOTATION_ENCRYPTED_SYSTEM_ACCOUNTS],
        )
        .unwrap();
        let password = Encryptor::new(TEST_ENCRYPTION_KEY)
            .decrypt(&accounts["postgresql"]["root"])
            .unwrap();
        assert_eq!(password, b"r00t");
    }

    #[tokio::test]
    async fn test_mode_violation_fails_backup() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        statuses.install(&mut client);

        let ctx = context(client, MockActionExecutor::new(), &events, t(0));
        let action = reconcile(Arc::new(new_backup("broken")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = statuses.last();
        assert_eq!(status.phase, Some(BackupPhase::Failed));
        assert_eq!(
            status.failure_reason.as_deref(),
            Some("backup method broken should specify snapshotVolumes or actionSetName")
        );
        // no start time yet: retention counts from creation, else now
        assert!(status.expiration.is_some());
        assert_eq!(events.reasons(), vec![reasons::BACKUP_FAILED]);
    }

    #[tokio::test]
    async fn test_no_target_pods_fails_backup() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = MockBackupClient::new();
        client
            .expect_get_backup_policy()
            .returning(|_, _| Ok(Some(policy())));
        client
            .expect_get_action_set()
            .returning(|_| Ok(Some(crate::request::tests::full_action_set())));
        client
            .expect_get_backup_repo()
            .returning(|_| Ok(Some(crate::request::tests::repo())));
        client.expect_pvc_exists().returning(|_, _| Ok(true));
        client.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        client.expect_patch_backup_metadata().never();
        statuses.install(&mut client);

        let ctx = context(client, MockActionExecutor::new(), &events, t(0));
        let action = reconcile(Arc::new(new_backup("pg-basebackup")), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert_eq!(statuses.count(), 1);
        let status = statuses.last();
        assert_eq!(status.phase, Some(BackupPhase::Failed));
        assert_eq!(
            status.failure_reason.as_deref(),
            Some("failed to get target pods by backup policy pg/pg-policy")
        );
        assert_eq!(events.reasons(), vec![reasons::BACKUP_FAILED]);
    }

    /// Story: pass N sees pod-a done and pod-b still running; pass N+1 sees
    /// pod-b finish and the backup completes with its duration.
    #[tokio::test]
    async fn story_two_targets_complete_across_passes() {
        let events = EventCapture::default();

        // Pass N
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        statuses.install(&mut client);
        let executor = executor_reporting(vec![
            ("pre-backup-0", "pod-a", ActionPhase::Completed),
            (BACKUP_DATA_ACTION, "pod-a", ActionPhase::Completed),
            ("pre-backup-0", "pod-b", ActionPhase::Completed),
            (BACKUP_DATA_ACTION, "pod-b", ActionPhase::Running),
        ]);
        let ctx = context(client, executor, &events, t(60));
        let action = reconcile(Arc::new(running_backup(&["pod-a", "pod-b"])), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)));
        let after_n = statuses.last();
        assert_eq!(after_n.phase, Some(BackupPhase::Running));
        assert_eq!(after_n.completion_timestamp, None);
        assert_eq!(after_n.total_size.as_deref(), Some("3Gi"));

        // Pass N+1
        let mut backup = running_backup(&["pod-a", "pod-b"]);
        backup.status = Some(after_n);
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        statuses.install(&mut client);
        let mut executor = MockActionExecutor::new();
        executor
            .expect_execute()
            .withf(|_, action| action.target_pod.name == "pod-b" && action.name == BACKUP_DATA_ACTION)
            .times(1)
            .returning(|_, action| {
                Ok(ActionStatus {
                    name: action.name.clone(),
                    target_pod_name: action.target_pod.name.clone(),
                    phase: ActionPhase::Completed,
                    ..Default::default()
                })
            });
        let ctx = context(client, executor, &events, t(90));
        reconcile(Arc::new(backup), ctx).await.unwrap();

        let done = statuses.last();
        assert_eq!(done.phase, Some(BackupPhase::Completed));
        assert_eq!(done.completion_timestamp, Some(t(90)));
        assert_eq!(done.duration.as_deref(), Some("1m30s"));
        assert!(done.actions.iter().all(|a| a.phase == ActionPhase::Completed));
        assert_eq!(events.reasons(), vec![reasons::CREATED_BACKUP]);
    }

    /// A failure is only reported once nothing else is running
    #[tokio::test]
    async fn test_failed_action_waits_for_siblings() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        statuses.install(&mut client);
        let executor = executor_reporting(vec![
            ("pre-backup-0", "pod-a", ActionPhase::Failed),
            ("pre-backup-0", "pod-b", ActionPhase::Completed),
            (BACKUP_DATA_ACTION, "pod-b", ActionPhase::Running),
        ]);
        let ctx = context(client, executor, &events, t(30));
        reconcile(Arc::new(running_backup(&["pod-a", "pod-b"])), ctx)
            .await
            .unwrap();
        let status = statuses.last();
        assert_eq!(status.phase, Some(BackupPhase::Running));
        let pod_a_data = status
            .actions
            .iter()
            .find(|a| a.target_pod_name == "pod-a" && a.name == BACKUP_DATA_ACTION)
            .unwrap();
        assert_eq!(pod_a_data.phase, ActionPhase::New);

        // pod-b finishes; pod-a's data action stays New behind its failed pre step
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        statuses.install(&mut client);
        let executor = executor_reporting(vec![(BACKUP_DATA_ACTION, "pod-b", ActionPhase::Completed)]);
        let mut backup = running_backup(&["pod-a", "pod-b"]);
        backup.status = Some(status);
        let ctx = context(client, executor, &events, t(60));
        reconcile(Arc::new(backup), ctx).await.unwrap();

        let failed = statuses.last();
        assert_eq!(failed.phase, Some(BackupPhase::Failed));
        assert_eq!(failed.failure_reason.as_deref(), Some(FAILED_ACTIONS_REASON));
        assert_eq!(events.reasons(), vec![reasons::BACKUP_FAILED]);
    }

    #[tokio::test]
    async fn test_restore_in_progress_defers_without_patch() {
        let events = EventCapture::default();
        let mut client = MockBackupClient::new();
        healthy_cluster(&mut client, true);
        client.expect_patch_backup_status().never();
        client.expect_get_backup_policy().never();
        let mut executor = MockActionExecutor::new();
        executor.expect_execute().never();

        let ctx = context(client, executor, &events, t(0));
        let action = reconcile(Arc::new(running_backup(&["pg-main-0"])), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)));
        assert_eq!(events.reasons(), vec![reasons::RESTORE_IN_PROGRESS]);
    }

    #[tokio::test]
    async fn test_continuous_backup_completes_when_schedule_disabled() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = MockBackupClient::new();
        healthy_cluster(&mut client, false);
        client
            .expect_get_backup_schedule()
            .returning(|name, _| Ok(Some(wal_schedule(name, false))));
        statuses.install(&mut client);

        let mut backup = running_backup(&["pg-main-0"]);
        backup.spec.backup_method = "archive-wal".to_string();
        let labels = backup.metadata.labels.as_mut().unwrap();
        labels.insert(LABEL_BACKUP_TYPE.to_string(), "Continuous".to_string());
        labels.insert(LABEL_BACKUP_SCHEDULE.to_string(), "pg-schedule".to_string());

        let ctx = context(client, MockActionExecutor::new(), &events, t(3600));
        reconcile(Arc::new(backup), ctx).await.unwrap();

        let status = statuses.last();
        assert_eq!(status.phase, Some(BackupPhase::Completed));
        assert_eq!(status.duration.as_deref(), Some("1h0m0s"));
        assert!(status.actions.iter().all(|a| a.phase == ActionPhase::Completed));
        assert_eq!(status.expiration, Some(t(3600 + 7 * 86_400)));
        assert_eq!(events.reasons(), vec![reasons::CONTINUOUS_BACKUP_STOPPED]);
    }

    /// One reconcile pass over a streaming Continuous backup at `now`
    async fn continuous_pass(backup: Backup, now: DateTime<Utc>) -> StatusCapture {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = healthy_client();
        healthy_cluster(&mut client, false);
        client
            .expect_get_backup_schedule()
            .returning(|name, _| Ok(Some(wal_schedule(name, true))));
        statuses.install(&mut client);
        let executor = executor_reporting(vec![(BACKUP_DATA_ACTION, "pg-main-0", ActionPhase::Running)]);

        let ctx = context(client, executor, &events, now);
        let action = reconcile(Arc::new(backup), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_RUNNING_SECS)));
        assert!(events.reasons().is_empty());
        statuses
    }

    /// Story: a streaming Continuous backup records its expiration once and
    /// later idle passes leave the status untouched until the expiration has
    /// moved by a full requeue interval.
    #[tokio::test]
    async fn story_idle_continuous_backup_settles() {
        let first = continuous_pass(running_continuous_backup(), t(10)).await;
        assert_eq!(first.count(), 1);
        let settled = first.last();
        assert_eq!(settled.phase, Some(BackupPhase::Running));
        assert_eq!(settled.expiration, Some(t(10 + 7 * 86_400)));

        let mut backup = running_continuous_backup();
        backup.status = Some(settled.clone());
        let second = continuous_pass(backup.clone(), t(11)).await;
        assert_eq!(second.count(), 0);

        let later = continuous_pass(backup, t(10 + REQUEUE_RUNNING_SECS as i64)).await;
        assert_eq!(later.count(), 1);
        assert_eq!(
            later.last().expiration,
            Some(t(10 + REQUEUE_RUNNING_SECS as i64 + 7 * 86_400))
        );
    }

    #[tokio::test]
    async fn test_deletion_timestamp_forces_deleting() {
        let events = EventCapture::default();
        let statuses = StatusCapture::default();
        let mut client = MockBackupClient::new();
        statuses.install(&mut client);

        let mut backup = running_backup(&["pg-main-0"]);
        backup.metadata.deletion_timestamp = Some(Time(t(5)));
        let ctx = context(client, MockActionExecutor::new(), &events, t(5));
        reconcile(Arc::new(backup), ctx).await.unwrap();
        assert_eq!(statuses.last().phase, Some(BackupPhase::Deleting));
    }

    #[tokio::test]
    async fn test_transient_error_leaves_status_alone() {
        let events = EventCapture::default();
        let mut client = MockBackupClient::new();
        client.expect_get_backup_policy().returning(|_, _| Ok(None));
        client.expect_patch_backup_status().never();
        client.expect_patch_backup_metadata().never();

        let ctx = context(client, MockActionExecutor::new(), &events, t(0));
        let err = reconcile(Arc::new(new_backup("pg-basebackup")), ctx)
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_completed_backup_cleans_workloads() {
        let events = EventCapture::default();
        let mut client = MockBackupClient::new();
        client
            .expect_delete_workloads()
            .times(2)
            .returning(|_, _| Ok(()));
        let mut backup = running_backup(&["pg-main-0"]);
        backup.status.as_mut().unwrap().phase = Some(BackupPhase::Completed);

        let ctx = context(client, MockActionExecutor::new(), &events, t(0));
        let action = reconcile(Arc::new(backup), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_patched() {
        let statuses = StatusCapture::default();
        let mut client = MockBackupClient::new();
        statuses.install(&mut client);
        let events = EventCapture::default();
        let ctx = context(client, MockActionExecutor::new(), &events, t(0));

        let backup = running_backup(&["pg-main-0"]);
        let status = backup.status.clone().unwrap();
        commit_status(&ctx, &backup, &status).await.unwrap();
        assert_eq!(statuses.count(), 0);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let client = MockBackupClient::new();
        let events = EventCapture::default();
        let ctx = context(client, MockActionExecutor::new(), &events, t(0));

        let backup = deleting_backup(DeletionPolicy::Delete);
        let mut status = backup.status.clone().unwrap();
        status.phase = Some(BackupPhase::Running);
        assert!(commit_status(&ctx, &backup, &status).await.is_err());
    }

    #[test]
    fn test_error_policy_backs_off_then_resets() {
        let events = EventCapture::default();
        let ctx = context(MockBackupClient::new(), MockActionExecutor::new(), &events, t(0));
        let backup = Arc::new(running_backup(&["pg-main-0"]));
        let err = BackupError::requeue("backupRepo s3-repo is not ready yet");

        let delays: Vec<Action> = (0..3)
            .map(|_| error_policy(backup.clone(), &err, ctx.clone()))
            .collect();
        assert_eq!(
            delays,
            vec![
                Action::requeue(Duration::from_secs(5)),
                Action::requeue(Duration::from_secs(10)),
                Action::requeue(Duration::from_secs(20)),
            ]
        );

        ctx.retries.remove(&retry_key(&backup));
        assert_eq!(
            error_policy(backup, &err, ctx),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
