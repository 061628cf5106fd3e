//! Metrics registry for Stratum observability
//!
//! OpenTelemetry instruments for the backup lifecycle: reconcile latency,
//! error classification, phase transitions and deletion outcomes. Exported
//! through whatever meter provider telemetry installed (no-op otherwise).

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("stratum"));

/// Histogram of backup reconciliation duration
///
/// Labels:
/// - `phase`: phase the pass started in
/// - `result`: success, error
pub static BACKUP_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("stratum_backup_reconcile_duration_seconds")
        .with_description("Duration of backup reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of backup reconciliation errors
///
/// Labels:
/// - `error_type`: transient, fatal
pub static BACKUP_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratum_backup_reconcile_errors_total")
        .with_description("Total number of backup reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of backup phase transitions
///
/// Labels:
/// - `from`, `to`: phase names
pub static BACKUP_PHASE_TRANSITIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratum_backup_phase_transitions_total")
        .with_description("Total number of backup phase transitions")
        .with_unit("{transitions}")
        .build()
});

/// Counter of repository file deletion outcomes
///
/// Labels:
/// - `status`: Succeeded, Failed, Deleting, Unknown
pub static BACKUP_FILE_DELETIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("stratum_backup_file_deletions_total")
        .with_description("Outcomes reported by the backup repository deleter")
        .with_unit("{deletions}")
        .build()
});

/// Classification of a reconcile error for metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorType {
    /// Will be retried with backoff
    Transient,
    /// Drove the backup to Failed
    Fatal,
}

impl ErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

/// Record how long a reconcile pass took
pub fn record_reconcile(phase: &str, success: bool, seconds: f64) {
    BACKUP_RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("phase", phase.to_string()),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}

/// Record a classified reconcile error
pub fn record_error(error_type: ErrorType) {
    BACKUP_RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type.as_str())]);
}

/// Record a phase transition
pub fn record_transition(from: &str, to: &str) {
    BACKUP_PHASE_TRANSITIONS.add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}

/// Record a repository deleter outcome
pub fn record_file_deletion(status: &str) {
    BACKUP_FILE_DELETIONS.add(1, &[KeyValue::new("status", status.to_string())]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_provider_is_noop() {
        record_reconcile("Running", true, 0.25);
        record_error(ErrorType::Fatal);
        record_transition("New", "Running");
        record_file_deletion("Succeeded");
    }

    #[test]
    fn error_type_labels() {
        assert_eq!(ErrorType::Transient.as_str(), "transient");
        assert_eq!(ErrorType::Fatal.as_str(), "fatal");
    }
}
