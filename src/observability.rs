use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

// ── Business metrics (claim path) ───────────────────────────────

/// Counter: successful claims.
pub const RESERVATIONS_CREATED_TOTAL: &str = "slotguard_reservations_created_total";

/// Counter: claims that lost to another holder.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "slotguard_reservation_conflicts_total";

/// Counter: failed claims. Labels: reason.
pub const RESERVATION_ERRORS_TOTAL: &str = "slotguard_reservation_errors_total";

/// Histogram: request latency in seconds. Labels: route, status.
pub const REQUEST_DURATION_SECONDS: &str = "slotguard_request_duration_seconds";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: ledger rows deleted by reconciliation.
pub const RECONCILED_ROWS_TOTAL: &str = "slotguard_reconciled_rows_total";

/// Counter: reconciliation passes that failed.
pub const RECONCILE_FAILURES_TOTAL: &str = "slotguard_reconcile_failures_total";

/// Counter: expired holds dropped by the sweeper.
pub const HOLDS_SWEPT_TOTAL: &str = "slotguard_holds_swept_total";

// ── Ledger ──────────────────────────────────────────────────────

/// Gauge: rows currently in the ledger, dead or alive.
pub const LEDGER_ROWS: &str = "slotguard_ledger_rows";

/// Histogram: group-commit flush duration in seconds.
pub const LEDGER_FLUSH_DURATION_SECONDS: &str = "slotguard_ledger_flush_duration_seconds";

/// Histogram: group-commit batch size (records per flush).
pub const LEDGER_FLUSH_BATCH_SIZE: &str = "slotguard_ledger_flush_batch_size";

const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0];

/// Install the global Prometheus recorder. The handle renders `/metrics`.
pub fn init() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION_SECONDS.to_string()), LATENCY_BUCKETS)?
        .install_recorder()?;
    tracing::info!("prometheus recorder installed");
    Ok(handle)
}

/// Why a claim failed, as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    InvalidPayload,
    SystemError,
    OutcomeUnknown,
}

impl ErrorReason {
    pub fn as_label(self) -> &'static str {
        match self {
            ErrorReason::InvalidPayload => "invalid_payload",
            ErrorReason::SystemError => "system_error",
            ErrorReason::OutcomeUnknown => "outcome_unknown",
        }
    }
}

/// Metrics sink handed to the engine and the API at construction.
pub trait ReservationMetrics: Send + Sync {
    fn reservation_created(&self);
    fn reservation_conflict(&self);
    fn reservation_error(&self, reason: ErrorReason);
    fn request_completed(&self, route: &'static str, status: u16, elapsed: Duration);
    fn reconciled(&self, deleted: usize);
    fn reconcile_failed(&self);
    fn holds_swept(&self, swept: usize);
}

/// Forwards to the `metrics` facade, i.e. whatever recorder `init` installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl ReservationMetrics for PrometheusMetrics {
    fn reservation_created(&self) {
        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
    }

    fn reservation_conflict(&self) {
        metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
    }

    fn reservation_error(&self, reason: ErrorReason) {
        metrics::counter!(RESERVATION_ERRORS_TOTAL, "reason" => reason.as_label()).increment(1);
    }

    fn request_completed(&self, route: &'static str, status: u16, elapsed: Duration) {
        metrics::histogram!(REQUEST_DURATION_SECONDS, "route" => route, "status" => status.to_string())
            .record(elapsed.as_secs_f64());
    }

    fn reconciled(&self, deleted: usize) {
        metrics::counter!(RECONCILED_ROWS_TOTAL).increment(deleted as u64);
    }

    fn reconcile_failed(&self) {
        metrics::counter!(RECONCILE_FAILURES_TOTAL).increment(1);
    }

    fn holds_swept(&self, swept: usize) {
        metrics::counter!(HOLDS_SWEPT_TOTAL).increment(swept as u64);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ReservationMetrics for NoopMetrics {
    fn reservation_created(&self) {}
    fn reservation_conflict(&self) {}
    fn reservation_error(&self, _reason: ErrorReason) {}
    fn request_completed(&self, _route: &'static str, _status: u16, _elapsed: Duration) {}
    fn reconciled(&self, _deleted: usize) {}
    fn reconcile_failed(&self) {}
    fn holds_swept(&self, _swept: usize) {}
}

/// Keeps counts in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    pub created: AtomicU64,
    pub conflicts: AtomicU64,
    pub reconciled: AtomicU64,
    pub reconcile_failures: AtomicU64,
    pub swept: AtomicU64,
    errors: Mutex<Vec<ErrorReason>>,
    requests: Mutex<Vec<(&'static str, u16)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> Vec<ErrorReason> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<(&'static str, u16)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ReservationMetrics for RecordingMetrics {
    fn reservation_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn reservation_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    fn reservation_error(&self, reason: ErrorReason) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(reason);
        }
    }

    fn request_completed(&self, route: &'static str, status: u16, _elapsed: Duration) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((route, status));
        }
    }

    fn reconciled(&self, deleted: usize) {
        self.reconciled.fetch_add(deleted as u64, Ordering::Relaxed);
    }

    fn reconcile_failed(&self) {
        self.reconcile_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn holds_swept(&self, swept: usize) {
        self.swept.fetch_add(swept as u64, Ordering::Relaxed);
    }
}
