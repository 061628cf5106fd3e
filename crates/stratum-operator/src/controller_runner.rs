//! Controller runner - wires the Backup reconciler into a kube-runtime Controller

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use stratum_backup::{error_policy, reconcile, Context, EngineConfig};
use stratum_common::crd::Backup;
use stratum_common::{APP_NAME, LABEL_BACKUP_NAME, LABEL_BACKUP_NAMESPACE, LABEL_MANAGED_BY};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Backup a workload belongs to, from the identity labels the engine stamps
/// on every Job, StatefulSet and pod template it creates.
fn backup_ref(
    labels: &std::collections::BTreeMap<String, String>,
    fallback_namespace: Option<String>,
) -> Option<ObjectRef<Backup>> {
    let name = labels.get(LABEL_BACKUP_NAME)?;
    let namespace = labels
        .get(LABEL_BACKUP_NAMESPACE)
        .cloned()
        .or(fallback_namespace)?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Pods only trigger a reconcile when the operator manages them
fn backup_for_pod(pod: &Pod) -> Option<ObjectRef<Backup>> {
    let labels = pod.labels();
    if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(APP_NAME) {
        return None;
    }
    backup_ref(labels, pod.namespace())
}

/// Jobs may live in the controller namespace, so the backup namespace comes
/// from the label first.
fn backup_for_job(job: &Job) -> Option<ObjectRef<Backup>> {
    backup_ref(job.labels(), job.namespace())
}

/// Run the Backup controller until a shutdown signal arrives
pub async fn run_backup_controller(client: Client, config: EngineConfig, workers: u16) {
    let ctx = Arc::new(Context::builder(client.clone(), config).build());
    let backups: Api<Backup> = Api::all(client.clone());
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let managed = || {
        WatcherConfig::default()
            .timeout(WATCH_TIMEOUT_SECS)
            .labels(&format!("{LABEL_MANAGED_BY}={APP_NAME}"))
    };

    tracing::info!(workers, "- Backup controller");

    Controller::new(backups, watcher())
        .with_config(ControllerConfig::default().concurrency(workers))
        .watches(Api::<StatefulSet>::all(client.clone()), managed(), |sts| {
            backup_ref(sts.labels(), sts.namespace())
        })
        .watches(Api::<Job>::all(client.clone()), managed(), |job| backup_for_job(&job))
        .watches(Api::<Pod>::all(client), managed(), |pod| backup_for_pod(&pod))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Backup"))
        .await;
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    fn meta(namespace: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some("w".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_in_controller_namespace_maps_to_backup_namespace() {
        let job = Job {
            metadata: meta(
                "stratum-system",
                &[(LABEL_BACKUP_NAME, "pg-backup-1"), (LABEL_BACKUP_NAMESPACE, "pg")],
            ),
            ..Default::default()
        };
        assert_eq!(
            backup_for_job(&job),
            Some(ObjectRef::new("pg-backup-1").within("pg"))
        );
    }

    #[test]
    fn test_job_without_identity_is_ignored() {
        let job = Job {
            metadata: meta("pg", &[]),
            ..Default::default()
        };
        assert_eq!(backup_for_job(&job), None);
    }

    #[test]
    fn test_only_managed_pods_trigger() {
        let managed = Pod {
            metadata: meta(
                "pg",
                &[(LABEL_MANAGED_BY, APP_NAME), (LABEL_BACKUP_NAME, "pg-backup-1")],
            ),
            ..Default::default()
        };
        assert_eq!(
            backup_for_pod(&managed),
            Some(ObjectRef::new("pg-backup-1").within("pg"))
        );

        let foreign = Pod {
            metadata: meta("pg", &[(LABEL_BACKUP_NAME, "pg-backup-1")]),
            ..Default::default()
        };
        assert_eq!(backup_for_pod(&foreign), None);
    }
}
