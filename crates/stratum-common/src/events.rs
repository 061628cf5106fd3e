//! Kubernetes Event recording for Stratum controllers.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so controllers can
//! emit Events visible via `kubectl describe backup` while tests stay offline.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "CreatedBackup")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Every action finished and the backup is Completed
    pub const CREATED_BACKUP: &str = "CreatedBackup";
    /// Backup moved to Failed
    pub const BACKUP_FAILED: &str = "BackupFailed";
    /// Running work deferred because a restore targets the same cluster
    pub const RESTORE_IN_PROGRESS: &str = "RestoreInProgress";
    /// Deletion refused because deletionPolicy is Retain
    pub const RETAIN: &str = "Retain";
    /// Backup deletion started
    pub const DELETING_BACKUP: &str = "DeletingBackup";
    /// Repository deleter reported a failure
    pub const DELETE_BACKUP_FILES_FAILED: &str = "DeleteBackupFilesFailed";
    /// Continuous backup stopped because its schedule or cluster went away
    pub const CONTINUOUS_BACKUP_STOPPED: &str = "ContinuousBackupStopped";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Running backup actions
    pub const BACKUP: &str = "Backup";
    /// Deleting backup resources
    pub const DELETE: &str = "Delete";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::CREATED_BACKUP, "CreatedBackup");
        assert_eq!(reasons::DELETE_BACKUP_FILES_FAILED, "DeleteBackupFilesFailed");
        assert_eq!(actions::DELETE, "Delete");
    }
}
