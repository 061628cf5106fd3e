//! Cluster state recorded on a Backup when it starts
//!
//! A restore rebuilds the database cluster from two annotations: the cluster
//! snapshot, and the system account passwords encrypted with the operator's
//! key and grouped by component.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

use stratum_common::crd::Backup;
use stratum_common::crypto::Encryptor;
use stratum_common::{
    ANNOTATION_CLUSTER_SNAPSHOT, ANNOTATION_ENCRYPTED_SYSTEM_ACCOUNTS, LABEL_APP_COMPONENT,
    LABEL_APP_INSTANCE, LABEL_SHARDING_NAME,
};

use crate::client::{BackupClient, TargetCluster};
use crate::error::BackupError;

/// Secret data key holding an account name
const ACCOUNT_USERNAME_KEY: &str = "username";
/// Secret data key holding an account password
const ACCOUNT_PASSWORD_KEY: &str = "password";

/// `{component: {username: encrypted password}}`
pub type SystemAccounts = BTreeMap<String, BTreeMap<String, String>>;

/// Group account Secrets by component, encrypting each password.
///
/// Only Secrets carrying both a username and a password count as accounts.
/// The component comes from the component label, else the sharding label.
pub fn system_accounts(
    secrets: &[Secret],
    encryptor: &Encryptor,
) -> Result<SystemAccounts, BackupError> {
    let mut accounts = SystemAccounts::new();
    for secret in secrets {
        let Some(data) = &secret.data else {
            continue;
        };
        let (Some(username), Some(password)) =
            (data.get(ACCOUNT_USERNAME_KEY), data.get(ACCOUNT_PASSWORD_KEY))
        else {
            continue;
        };
        let labels = secret.labels();
        let component = labels
            .get(LABEL_APP_COMPONENT)
            .filter(|c| !c.is_empty())
            .or_else(|| labels.get(LABEL_SHARDING_NAME))
            .cloned()
            .unwrap_or_default();
        accounts.entry(component).or_default().insert(
            String::from_utf8_lossy(&username.0).into_owned(),
            encryptor.encrypt(&password.0)?,
        );
    }
    Ok(accounts)
}

/// The Backup's annotations with the cluster snapshot and encrypted system
/// accounts added.
///
/// Accounts are encrypted once per Backup; a recorded value is kept as is.
pub async fn backup_annotations(
    client: &dyn BackupClient,
    encryptor: Option<&Encryptor>,
    backup: &Backup,
    cluster: Option<&TargetCluster>,
) -> Result<BTreeMap<String, String>, BackupError> {
    let mut annotations = backup.annotations().clone();
    let Some(cluster) = cluster else {
        return Ok(annotations);
    };

    if let Some(snapshot) = &cluster.snapshot {
        annotations.insert(ANNOTATION_CLUSTER_SNAPSHOT.to_string(), snapshot.clone());
    }

    if annotations.contains_key(ANNOTATION_ENCRYPTED_SYSTEM_ACCOUNTS) {
        return Ok(annotations);
    }
    let Some(encryptor) = encryptor else {
        debug!(backup = %backup.name_any(), "no encryption key configured, system accounts not recorded");
        return Ok(annotations);
    };

    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;
    let selector = format!("{}={}", LABEL_APP_INSTANCE, cluster.name);
    let secrets = client.list_secrets(&namespace, &selector).await?;
    let accounts = system_accounts(&secrets, encryptor)?;
    if !accounts.is_empty() {
        annotations.insert(
            ANNOTATION_ENCRYPTED_SYSTEM_ACCOUNTS.to_string(),
            serde_json::to_string(&accounts)?,
        );
    }
    Ok(annotations)
}
