//! Stratum data-protection operator

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::CustomResourceExt;

use stratum_backup::EngineConfig;
use stratum_common::crd::{ActionSet, Backup, BackupPolicy, BackupRepo, BackupSchedule};
use stratum_common::crypto::Encryptor;
use stratum_common::telemetry::{init_telemetry, TelemetryConfig};

mod controller_runner;

/// Stratum - backup lifecycle controller for database clusters
#[derive(Parser, Debug)]
#[command(name = "stratum-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster config when unset
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Backups reconciled in parallel
    #[arg(long, env = "DP_RECONCILE_WORKERS", default_value_t = 4)]
    reconcile_workers: u16,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = stratum_common::STRATUM_SYSTEM_NAMESPACE)]
    controller_namespace: String,

    /// Service account for backup workloads when a target does not name one
    #[arg(long, env = "DP_WORKER_SERVICE_ACCOUNT", default_value = stratum_backup::config::DEFAULT_WORKER_SERVICE_ACCOUNT)]
    worker_service_account: String,

    /// Image for exec-action and deletion Jobs
    #[arg(long, env = "DP_EXECUTOR_IMAGE", default_value = stratum_backup::config::DEFAULT_EXECUTOR_IMAGE)]
    executor_image: String,

    /// activeDeadlineSeconds for Full and Selective backup Jobs
    #[arg(long, env = "DP_JOB_DEADLINE_FULL_SECS")]
    job_deadline_full_secs: Option<u64>,

    /// activeDeadlineSeconds for Incremental backup Jobs
    #[arg(long, env = "DP_JOB_DEADLINE_INCREMENTAL_SECS")]
    job_deadline_incremental_secs: Option<u64>,

    /// First retry delay after a transient error
    #[arg(long, env = "DP_BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,

    /// Upper bound for the retry delay
    #[arg(long, env = "DP_BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Passphrase for encrypting system account passwords recorded on Backups
    #[arg(long, env = "DP_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "DP_TEXT_LOGS")]
    text_logs: bool,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            controller_namespace: self.controller_namespace.clone(),
            worker_service_account: self.worker_service_account.clone(),
            executor_image: self.executor_image.clone(),
            job_deadline_full: self.job_deadline_full_secs.map(Duration::from_secs),
            job_deadline_incremental: self.job_deadline_incremental_secs.map(Duration::from_secs),
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
            encryptor: self
                .encryption_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(Encryptor::new),
        }
    }
}

/// Every CRD the operator reads, as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let crds = [
        Backup::crd(),
        BackupPolicy::crd(),
        ActionSet::crd(),
        BackupRepo::crd(),
        BackupSchedule::crd(),
    ];
    let mut out = String::new();
    for crd in &crds {
        let yaml = serde_yaml::to_string(crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        controller_namespace: Some(cli.controller_namespace.clone()),
        json_logs: !cli.text_logs,
        ..Default::default()
    })?;

    let config = cli.engine_config();
    tracing::info!(
        namespace = %config.controller_namespace,
        workers = cli.reconcile_workers,
        executor_image = %config.executor_image,
        "starting stratum operator"
    );

    let client = stratum_common::kube_utils::create_client(cli.kubeconfig.as_deref()).await?;
    controller_runner::run_backup_controller(client, config, cli.reconcile_workers).await;

    tracing::info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["stratum-operator"]);
        assert_eq!(cli.reconcile_workers, 4);
        let config = cli.engine_config();
        let defaults = EngineConfig::default();
        assert_eq!(config.controller_namespace, defaults.controller_namespace);
        assert_eq!(config.executor_image, defaults.executor_image);
        assert_eq!(config.backoff_base, defaults.backoff_base);
        assert_eq!(config.backoff_max, defaults.backoff_max);
        assert_eq!(config.job_deadline_full, None);
        assert!(config.encryptor.is_none());
    }

    #[test]
    fn test_encryption_key_builds_encryptor() {
        let cli = Cli::parse_from(["stratum-operator", "--encryption-key", "k3y"]);
        let encryptor = cli.engine_config().encryptor.unwrap();
        let sealed = encryptor.encrypt(b"pw").unwrap();
        assert_eq!(Encryptor::new("k3y").decrypt(&sealed).unwrap(), b"pw");
    }

    #[rstest]
    #[case(&["--job-deadline-full-secs", "3600"], Some(3600), None)]
    #[case(&["--job-deadline-incremental-secs", "600"], None, Some(600))]
    fn test_job_deadlines(
        #[case] args: &[&str],
        #[case] full: Option<u64>,
        #[case] incremental: Option<u64>,
    ) {
        let cli = Cli::parse_from(std::iter::once("stratum-operator").chain(args.iter().copied()));
        let config = cli.engine_config();
        assert_eq!(config.job_deadline_full, full.map(Duration::from_secs));
        assert_eq!(config.job_deadline_incremental, incremental.map(Duration::from_secs));
    }

    #[test]
    fn test_backoff_max_never_below_base() {
        let cli = Cli::parse_from([
            "stratum-operator",
            "--backoff-base-secs",
            "60",
            "--backoff-max-secs",
            "10",
        ]);
        assert_eq!(cli.engine_config().backoff_max, Duration::from_secs(60));
    }

    #[test]
    fn test_crd_manifests_cover_every_kind() {
        let yaml = crd_manifests().unwrap();
        for name in [
            "backups.dataprotection.stratum.dev",
            "backuppolicies.dataprotection.stratum.dev",
            "actionsets.dataprotection.stratum.dev",
            "backuprepos.dataprotection.stratum.dev",
            "backupschedules.dataprotection.stratum.dev",
        ] {
            assert!(yaml.contains(name), "missing {name}");
        }
    }
}
