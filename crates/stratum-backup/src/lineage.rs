//! Parent and base resolution for incremental backups
//!
//! An incremental backup chains onto a parent. The chain's base is always a
//! Full backup: the parent itself when it is Full, otherwise the base the
//! parent already recorded.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::debug;

use stratum_common::crd::{Backup, BackupMethod, BackupPhase, BackupPolicy, BackupType};
use stratum_common::{LABEL_APP_INSTANCE, LABEL_BACKUP_POLICY, LABEL_BACKUP_REPO, LABEL_BACKUP_TYPE};

use crate::client::BackupClient;
use crate::error::BackupError;

/// Parent and base of an incremental backup
#[derive(Clone, Debug, PartialEq)]
pub struct Lineage {
    /// Nearest prior backup in the chain
    pub parent: Backup,
    /// Full backup at the root of the chain
    pub base: Backup,
}

fn qualified(backup: &Backup) -> String {
    format!("{}/{}", backup.namespace().unwrap_or_default(), backup.name_any())
}

/// Pick the most recent completed backup eligible as a parent.
///
/// Candidates share the policy and repo, ran `method` or the method it is
/// compatible with, and belong to the same database cluster. Newest
/// completion wins; ties go to the lexically smallest name.
pub fn latest_eligible_parent<'a>(
    backup: &Backup,
    method: &BackupMethod,
    candidates: &'a [Backup],
) -> Option<&'a Backup> {
    let instance = backup.labels().get(LABEL_APP_INSTANCE);
    let mut eligible: Vec<&Backup> = candidates
        .iter()
        .filter(|c| c.name_any() != backup.name_any())
        .filter(|c| c.phase() == BackupPhase::Completed)
        .filter(|c| {
            c.spec.backup_method == method.name
                || method.compatible_method.as_deref() == Some(c.spec.backup_method.as_str())
        })
        .filter(|c| instance.is_none() || c.labels().get(LABEL_APP_INSTANCE) == instance)
        .collect();

    eligible.sort_by(|a, b| {
        let done = |x: &Backup| x.status.as_ref().and_then(|s| s.completion_timestamp);
        done(b)
            .cmp(&done(a))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
    eligible.into_iter().next()
}

async fn find_parent(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
    method: &BackupMethod,
    repo_name: &str,
) -> Result<Backup, BackupError> {
    let namespace = backup.namespace().ok_or(BackupError::MissingNamespace)?;

    let explicit = backup
        .status
        .as_ref()
        .and_then(|s| s.parent_backup_name.clone())
        .or_else(|| backup.spec.parent_backup_name.clone())
        .filter(|n| !n.is_empty());

    if let Some(name) = explicit {
        let parent = client.get_backup(&name, &namespace).await?.ok_or_else(|| {
            BackupError::fatal(format!("failed to get parent backup {namespace}/{name}"))
        })?;
        if parent.phase() != BackupPhase::Completed {
            return Err(BackupError::fatal(format!(
                "parent backup {namespace}/{name} is not completed"
            )));
        }
        return Ok(parent);
    }

    let labels = BTreeMap::from([
        (LABEL_BACKUP_POLICY.to_string(), policy.name_any()),
        (LABEL_BACKUP_REPO.to_string(), repo_name.to_string()),
    ]);
    let candidates = client.list_backups(&namespace, &labels).await?;
    latest_eligible_parent(backup, method, &candidates)
        .cloned()
        .ok_or_else(|| {
            BackupError::fatal(format!(
                "no completed backup of method {} found in backupRepo {repo_name} to use as parent of backup {}",
                method.name,
                qualified(backup)
            ))
        })
}

/// Backup type of an existing backup: its type label, else the type of the
/// ActionSet its method references.
pub async fn backup_type_of(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
) -> Result<BackupType, BackupError> {
    if let Some(label) = backup.labels().get(LABEL_BACKUP_TYPE) {
        return Ok(label.parse()?);
    }
    let Some(method) = policy.spec.method(&backup.spec.backup_method) else {
        return Err(BackupError::fatal(format!(
            "backupMethod: {} not found",
            backup.spec.backup_method
        )));
    };
    let Some(action_set_name) = method.action_set() else {
        return Ok(BackupType::Full);
    };
    let action_set = client
        .get_action_set(action_set_name)
        .await?
        .ok_or_else(|| BackupError::requeue(format!("actionSet {action_set_name} not found")))?;
    Ok(action_set.spec.backup_type)
}

/// Resolve the parent and base for an incremental backup bound to `repo_name`
pub async fn resolve_lineage(
    client: &dyn BackupClient,
    backup: &Backup,
    policy: &BackupPolicy,
    method: &BackupMethod,
    repo_name: Option<&str>,
) -> Result<Lineage, BackupError> {
    let Some(repo_name) = repo_name.filter(|r| !r.is_empty()) else {
        return Err(BackupError::fatal(
            "backupRepo for incremental backup can't be empty",
        ));
    };

    let parent = find_parent(client, backup, policy, method, repo_name).await?;
    let parent_type = backup_type_of(client, &parent, policy).await?;
    debug!(backup = %backup.name_any(), parent = %parent.name_any(), %parent_type, "resolved parent backup");

    let base = match parent_type {
        BackupType::Full => parent.clone(),
        BackupType::Incremental => {
            let parent_ns = parent.namespace().unwrap_or_default();
            let base_name = parent
                .status
                .as_ref()
                .and_then(|s| s.base_backup_name.clone())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    BackupError::fatal(format!(
                        "backup {} base backup name is empty",
                        qualified(&parent)
                    ))
                })?;
            match client.get_backup(&base_name, &parent_ns).await {
                Ok(Some(base)) => base,
                Ok(None) => {
                    return Err(BackupError::fatal(format!(
                        "failed to get base backup {parent_ns}/{base_name}: not found"
                    )))
                }
                Err(e) => {
                    return Err(BackupError::fatal(format!(
                        "failed to get base backup {parent_ns}/{base_name}: {e}"
                    )))
                }
            }
        }
        other => {
            return Err(BackupError::fatal(format!(
                "parent backup type is {other}, but only full and incremental backup are supported"
            )))
        }
    };

    Ok(Lineage { parent, base })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockBackupClient;
    use chrono::{TimeZone, Utc};
    use stratum_common::crd::{BackupPolicySpec, BackupSpec, BackupStatus};

    fn policy() -> BackupPolicy {
        let mut p = BackupPolicy::new(
            "pg-policy",
            BackupPolicySpec {
                backup_methods: vec![
                    BackupMethod {
                        name: "full".to_string(),
                        action_set_name: Some("pg-basebackup".to_string()),
                        ..Default::default()
                    },
                    BackupMethod {
                        name: "incr".to_string(),
                        action_set_name: Some("pg-incremental".to_string()),
                        compatible_method: Some("full".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        );
        p.metadata.namespace = Some("pg".to_string());
        p
    }

    fn incr_method() -> BackupMethod {
        policy().spec.backup_methods[1].clone()
    }

    fn completed(name: &str, method: &str, backup_type: &str, at: i64) -> Backup {
        let mut b = Backup::new(
            name,
            BackupSpec {
                backup_policy_name: "pg-policy".to_string(),
                backup_method: method.to_string(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("pg".to_string());
        b.metadata.labels = Some(BTreeMap::from([
            (LABEL_BACKUP_TYPE.to_string(), backup_type.to_string()),
            (LABEL_APP_INSTANCE.to_string(), "pg-main".to_string()),
        ]));
        b.status = Some(BackupStatus {
            phase: Some(BackupPhase::Completed),
            completion_timestamp: Some(Utc.timestamp_opt(1_700_000_000 + at, 0).unwrap()),
            ..Default::default()
        });
        b
    }

    fn new_incremental() -> Backup {
        let mut b = Backup::new(
            "incr-2",
            BackupSpec {
                backup_policy_name: "pg-policy".to_string(),
                backup_method: "incr".to_string(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("pg".to_string());
        b.metadata.labels = Some(BTreeMap::from([(
            LABEL_APP_INSTANCE.to_string(),
            "pg-main".to_string(),
        )]));
        b
    }

    #[test]
    fn test_latest_parent_ordering() {
        let mut running = completed("full-9", "full", "Full", 900);
        running.status.as_mut().unwrap().phase = Some(BackupPhase::Running);
        let mut other_cluster = completed("full-8", "full", "Full", 800);
        other_cluster
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert(LABEL_APP_INSTANCE.to_string(), "other".to_string());
        let candidates = vec![
            completed("full-1", "full", "Full", 100),
            completed("incr-b", "incr", "Incremental", 500),
            completed("incr-a", "incr", "Incremental", 500),
            completed("snap-1", "volume-snapshot", "Full", 700),
            running,
            other_cluster,
        ];
        let parent = latest_eligible_parent(&new_incremental(), &incr_method(), &candidates).unwrap();
        assert_eq!(parent.name_any(), "incr-a");
    }

    /// Story: incr-2 chains onto incr-1, whose base is full-1. The new
    /// backup inherits full-1 as its base.
    #[tokio::test]
    async fn story_incremental_parent_inherits_base() {
        let mut incr_1 = completed("incr-1", "incr", "Incremental", 200);
        incr_1.status.as_mut().unwrap().base_backup_name = Some("full-1".to_string());
        let full_1 = completed("full-1", "full", "Full", 100);

        let mut client = MockBackupClient::new();
        let listed = vec![full_1.clone(), incr_1.clone()];
        client
            .expect_list_backups()
            .withf(|ns, labels| {
                ns == "pg" && labels.get(LABEL_BACKUP_REPO).map(String::as_str) == Some("s3-repo")
            })
            .returning(move |_, _| Ok(listed.clone()));
        let base = full_1.clone();
        client
            .expect_get_backup()
            .withf(|name, ns| name == "full-1" && ns == "pg")
            .returning(move |_, _| Ok(Some(base.clone())));

        let lineage = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap();
        assert_eq!(lineage.parent.name_any(), "incr-1");
        assert_eq!(lineage.base.name_any(), "full-1");
    }

    #[tokio::test]
    async fn test_full_parent_is_its_own_base() {
        let full_1 = completed("full-1", "full", "Full", 100);
        let mut client = MockBackupClient::new();
        client
            .expect_list_backups()
            .returning(move |_, _| Ok(vec![full_1.clone()]));

        let lineage = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap();
        assert_eq!(lineage.parent.name_any(), "full-1");
        assert_eq!(lineage.base, lineage.parent);
    }

    #[tokio::test]
    async fn test_incremental_parent_without_base_is_fatal() {
        let incr_1 = completed("incr-1", "incr", "Incremental", 200);
        let mut client = MockBackupClient::new();
        client
            .expect_list_backups()
            .returning(move |_, _| Ok(vec![incr_1.clone()]));

        let err = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "backup pg/incr-1 base backup name is empty");
    }

    #[tokio::test]
    async fn test_missing_base_record_is_fatal() {
        let mut incr_1 = completed("incr-1", "incr", "Incremental", 200);
        incr_1.status.as_mut().unwrap().base_backup_name = Some("full-gone".to_string());
        let mut client = MockBackupClient::new();
        client
            .expect_list_backups()
            .returning(move |_, _| Ok(vec![incr_1.clone()]));
        client.expect_get_backup().returning(|_, _| Ok(None));

        let err = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("pg/full-gone"));
    }

    #[tokio::test]
    async fn test_explicit_parent_takes_precedence() {
        let mut backup = new_incremental();
        backup.spec.parent_backup_name = Some("full-0".to_string());
        let full_0 = completed("full-0", "full", "Full", 10);

        let mut client = MockBackupClient::new();
        client.expect_list_backups().never();
        client
            .expect_get_backup()
            .withf(|name, _| name == "full-0")
            .returning(move |_, _| Ok(Some(full_0.clone())));

        let lineage = resolve_lineage(&client, &backup, &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap();
        assert_eq!(lineage.base.name_any(), "full-0");
    }

    #[tokio::test]
    async fn test_continuous_parent_rejected() {
        let log = completed("log-1", "incr", "Continuous", 300);
        let mut client = MockBackupClient::new();
        client
            .expect_list_backups()
            .returning(move |_, _| Ok(vec![log.clone()]));

        let err = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), Some("s3-repo"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "parent backup type is Continuous, but only full and incremental backup are supported"
        );
    }

    #[tokio::test]
    async fn test_repo_required() {
        let client = MockBackupClient::new();
        let err = resolve_lineage(&client, &new_incremental(), &policy(), &incr_method(), None)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_type_falls_back_to_action_set() {
        let mut parent = completed("full-1", "full", "Full", 100);
        parent.metadata.labels = None;
        let mut client = MockBackupClient::new();
        client
            .expect_get_action_set()
            .withf(|name| name == "pg-basebackup")
            .returning(|name| {
                Ok(Some(stratum_common::crd::ActionSet::new(
                    name,
                    stratum_common::crd::ActionSetSpec {
                        backup_type: BackupType::Full,
                        ..Default::default()
                    },
                )))
            });
        assert_eq!(
            backup_type_of(&client, &parent, &policy()).await.unwrap(),
            BackupType::Full
        );
    }
}
