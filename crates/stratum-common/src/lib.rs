//! Common types for Stratum: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod crypto;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace the operator runs in
pub const STRATUM_SYSTEM_NAMESPACE: &str = "stratum-system";

/// Finalizer guarding a Backup until its external resources are cleaned up
pub const DATA_PROTECTION_FINALIZER: &str = "dataprotection.stratum.dev/finalizer";

/// Value of the managed-by label on everything this operator creates
pub const APP_NAME: &str = "stratum-dataprotection";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Standard Kubernetes instance label key, names the database cluster
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard Kubernetes component label key
pub const LABEL_APP_COMPONENT: &str = "app.kubernetes.io/component";

/// Label carrying the owning Backup name on execution workloads
pub const LABEL_BACKUP_NAME: &str = "dataprotection.stratum.dev/backup-name";

/// Label carrying the owning Backup namespace on execution workloads
pub const LABEL_BACKUP_NAMESPACE: &str = "dataprotection.stratum.dev/backup-namespace";

/// Label carrying the backup type (Full, Incremental, Continuous, Selective)
pub const LABEL_BACKUP_TYPE: &str = "dataprotection.stratum.dev/backup-type";

/// Label carrying the BackupPolicy name on a Backup
pub const LABEL_BACKUP_POLICY: &str = "dataprotection.stratum.dev/backup-policy";

/// Label carrying the BackupSchedule that created a Backup
pub const LABEL_BACKUP_SCHEDULE: &str = "dataprotection.stratum.dev/backup-schedule";

/// Label carrying the BackupRepo name on a Backup
pub const LABEL_BACKUP_REPO: &str = "dataprotection.stratum.dev/backup-repo-name";

/// Label set while the bound repo has not provisioned its PVC or tool config yet
pub const LABEL_WAIT_REPO_PREPARATION: &str = "dataprotection.stratum.dev/wait-repo-preparation";

/// Label carrying the UID of the database cluster a Backup belongs to
pub const LABEL_CLUSTER_UID: &str = "dataprotection.stratum.dev/cluster-uid";

/// Annotation that makes the controller skip a Backup entirely
pub const ANNOTATION_SKIP_RECONCILIATION: &str = "dataprotection.stratum.dev/skip-reconciliation";

/// Annotation marking the default BackupRepo
pub const ANNOTATION_DEFAULT_REPO: &str = "dataprotection.stratum.dev/is-default-repo";

/// Annotation present on a database cluster while a restore is running against it
pub const ANNOTATION_RESTORE_FROM_BACKUP: &str = "stratum.dev/restore-from-backup";

/// Annotation on a database cluster while an operation request is applied to it
pub const ANNOTATION_OPS_REQUEST: &str = "stratum.dev/ops-request";

/// Backup annotation holding the cluster's name, namespace, annotations and spec as JSON
pub const ANNOTATION_CLUSTER_SNAPSHOT: &str = "dataprotection.stratum.dev/cluster-snapshot";

/// Backup annotation holding `{component: {username: encrypted password}}` as JSON
pub const ANNOTATION_ENCRYPTED_SYSTEM_ACCOUNTS: &str =
    "dataprotection.stratum.dev/encrypted-system-accounts";

/// Label naming the shard a component belongs to
pub const LABEL_SHARDING_NAME: &str = "apps.stratum.dev/sharding-name";
