//! Status projection
//!
//! Folds per-action results into the Backup status. Action identity is the
//! pair (name, target pod); once an action is Completed or Failed its entry
//! is frozen, so stale results delivered by a later pass cannot regress it.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use kube::ResourceExt;

use stratum_common::crd::{
    ActionPhase, ActionStatus, Backup, BackupPhase, BackupStatus, BackupType, RetentionPeriod,
};

use crate::error::BackupError;
use crate::{LOG_COLLECTOR_MARKER, REQUEUE_RUNNING_SECS};

/// Outcome of aggregating every action of the current run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    /// An action is still running, or not started with nothing failed
    Waiting,
    /// Nothing is in flight and at least one action failed
    Failed,
    /// Every action completed
    Completed,
}

/// Merge a freshly observed action result into the action list.
///
/// Returns the entry as stored after the merge.
pub fn merge_action_status(
    actions: &mut Vec<ActionStatus>,
    mut observed: ActionStatus,
    now: DateTime<Utc>,
) -> ActionStatus {
    let existing = actions
        .iter_mut()
        .find(|a| a.name == observed.name && a.target_pod_name == observed.target_pod_name);

    let Some(existing) = existing else {
        if observed.start_timestamp.is_none() {
            observed.start_timestamp = Some(now);
        }
        actions.push(observed.clone());
        return observed;
    };

    if existing.phase.is_terminal() {
        return existing.clone();
    }

    if existing
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.starts_with(LOG_COLLECTOR_MARKER))
    {
        observed.failure_reason = existing.failure_reason.clone();
    }
    if existing.start_timestamp.is_some() {
        observed.start_timestamp = existing.start_timestamp;
    }
    if observed.workload_name.is_none() {
        observed.workload_name = existing.workload_name.clone();
    }
    *existing = observed;
    existing.clone()
}

/// Copy size and time range reported by an action into the aggregate status
/// the first time they appear.
pub fn propagate_totals(status: &mut BackupStatus, action: &ActionStatus) {
    if status.total_size.is_none() {
        if let Some(size) = action.total_size.as_ref().filter(|s| !s.is_empty()) {
            status.total_size = Some(size.clone());
        }
    }
    if status.time_range.is_none() && action.time_range.is_some() {
        status.time_range = action.time_range.clone();
    }
}

/// Aggregate the action list after a pass has executed it.
///
/// Running beats Failed so a failure is only reported once every sibling has
/// settled. An action still New at that point sits behind a failed step on
/// its pod and will never start, so it does not hold off the failure.
pub fn aggregate(actions: &[ActionStatus]) -> Aggregate {
    let any = |phase: ActionPhase| actions.iter().any(|a| a.phase == phase);
    if any(ActionPhase::Running) {
        Aggregate::Waiting
    } else if any(ActionPhase::Failed) {
        Aggregate::Failed
    } else if any(ActionPhase::New) {
        Aggregate::Waiting
    } else {
        Aggregate::Completed
    }
}

/// Stamp completion bookkeeping: phase, completion time and duration
pub fn mark_completed(status: &mut BackupStatus, now: DateTime<Utc>) {
    status.phase = Some(BackupPhase::Completed);
    status.completion_timestamp = Some(now);
    status.duration = status
        .start_timestamp
        .map(|start| format_duration(now - start));
}

/// Force every non-terminal action to Completed
pub fn complete_all_actions(status: &mut BackupStatus, now: DateTime<Utc>) {
    for action in status.actions.iter_mut().filter(|a| !a.phase.is_terminal()) {
        action.phase = ActionPhase::Completed;
        action.completion_timestamp = Some(now);
    }
}

/// Render a duration rounded to whole seconds, e.g. `1h0m5s`, `2m30s`, `45s`
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    let total = (millis + 500) / 1000;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Compute the expiration time from the Backup's retention period.
///
/// The period counts from the completion time of a finished Continuous
/// backup, from `now` for one that is still running, and from the start
/// time (else the creation time) for every other type. No retention period
/// means the backup never expires.
///
/// Results are whole seconds. While a Continuous backup runs, a recorded
/// expiration within one requeue interval of the new value is kept so an
/// otherwise idle pass writes nothing.
pub fn compute_expiration(
    backup: &Backup,
    status: &BackupStatus,
    backup_type: BackupType,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, BackupError> {
    let Some(raw) = backup
        .spec
        .retention_period
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(None);
    };
    let period: RetentionPeriod = raw.parse().map_err(|e| match e {
        stratum_common::Error::Validation { message, .. } => {
            stratum_common::Error::validation_for(backup.name_any(), message)
        }
        other => other,
    })?;
    if period.is_zero() {
        return Ok(None);
    }

    let rolling = backup_type == BackupType::Continuous
        && !(status.phase() == BackupPhase::Completed && status.completion_timestamp.is_some());
    let base = if backup_type == BackupType::Continuous {
        match status.completion_timestamp {
            Some(done) if !rolling => done,
            _ => now,
        }
    } else {
        status
            .start_timestamp
            .or_else(|| backup.creation_timestamp().map(|t| t.0))
            .unwrap_or(now)
    };
    let expiration = (base + period.to_duration()).trunc_subsecs(0);

    if rolling {
        if let Some(recorded) = status.expiration {
            if (expiration - recorded).num_seconds().unsigned_abs() < REQUEUE_RUNNING_SECS {
                return Ok(Some(recorded));
            }
        }
    }
    Ok(Some(expiration))
}
