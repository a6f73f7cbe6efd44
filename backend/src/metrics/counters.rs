use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    // ingestion
    pub ticks_accepted: Arc<AtomicU64>,
    pub ticks_malformed: Arc<AtomicU64>,
    pub ticks_stale: Arc<AtomicU64>,
    pub ticks_untracked: Arc<AtomicU64>,
    pub ticks_dropped_backpressure: Arc<AtomicU64>,

    // evaluation
    pub alerts_fired: Arc<AtomicU64>,
    pub alerts_suppressed: Arc<AtomicU64>,
    pub eval_errors: Arc<AtomicU64>,
    pub rules_invalid: Arc<AtomicU64>,

    // dispatch
    pub deliveries_sent: Arc<AtomicU64>,
    pub deliveries_failed: Arc<AtomicU64>,
    pub deliveries_skipped_open: Arc<AtomicU64>,
    pub circuits_opened: Arc<AtomicU64>,

    // alert log
    pub log_entries_dropped: Arc<AtomicU64>,
}
