use std::str::FromStr;

/// Runtime configuration for the alert engine, loaded from environment
/// variables with conservative defaults.
#[derive(Clone, Debug)]
pub struct AppConfig {
    // =========================
    // Ingestion configuration
    // =========================
    /// Capacity of the raw-payload queue between the provider boundary and
    /// the normalizer.
    ///
    /// Acts as backpressure on the feed reader: if normalization slows
    /// down, the reader naturally blocks instead of growing memory.
    pub ingest_queue_capacity: usize,

    /// Per-instrument evaluation queue capacity.
    ///
    /// When an instrument's consumer falls behind its producer, the oldest
    /// queued tick is dropped (stale ticks have diminishing alerting value)
    /// and the drop is logged and counted. Never a silent failure.
    pub instrument_queue_capacity: usize,

    // =========================
    // Dispatch configuration
    // =========================
    /// Capacity of the alert-event queue between the evaluation engine and
    /// the dispatcher.
    pub alert_queue_capacity: usize,

    /// Maximum number of alert events being delivered concurrently.
    ///
    /// Bounds dispatcher memory and outbound connection pressure; events
    /// beyond the bound wait in the alert queue.
    pub dispatch_max_in_flight: usize,

    /// Per-attempt delivery timeout (milliseconds). The only external I/O in
    /// the pipeline happens under this bound.
    pub dispatch_attempt_timeout_ms: u64,

    /// Retries after the first delivery attempt before the delivery is
    /// recorded as terminally failed.
    pub dispatch_max_retries: u32,

    /// Exponential backoff base between delivery attempts (milliseconds).
    pub dispatch_backoff_base_ms: u64,

    /// Consecutive failed deliveries before a channel's circuit opens.
    pub circuit_failure_threshold: u32,

    /// How long an open circuit waits before allowing a half-open probe
    /// (milliseconds).
    pub circuit_recovery_timeout_ms: u64,

    /// Optional chat-webhook endpoint. The webhook channel is only
    /// configured when this is set.
    pub webhook_url: Option<String>,

    // =========================
    // Alert log configuration
    // =========================
    /// Capacity of the buffered alert-log queue. Entries beyond the bound
    /// are dropped and counted rather than blocking the engine.
    pub log_queue_capacity: usize,

    /// Optional JSONL file path for the alert log. Defaults to the
    /// in-memory sink when unset.
    pub alert_log_path: Option<String>,

    // =========================
    // Lifecycle configuration
    // =========================
    /// Upper bound on the drain phase during graceful shutdown
    /// (milliseconds).
    pub shutdown_drain_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            ingest_queue_capacity: env_or("INGEST_QUEUE_CAPACITY", 1_024),
            instrument_queue_capacity: env_or("INSTRUMENT_QUEUE_CAPACITY", 256),

            alert_queue_capacity: env_or("ALERT_QUEUE_CAPACITY", 256),
            dispatch_max_in_flight: env_or("DISPATCH_MAX_IN_FLIGHT", 32),
            dispatch_attempt_timeout_ms: env_or("DISPATCH_ATTEMPT_TIMEOUT_MS", 5_000),
            dispatch_max_retries: env_or("DISPATCH_MAX_RETRIES", 2),
            dispatch_backoff_base_ms: env_or("DISPATCH_BACKOFF_BASE_MS", 250),
            circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_recovery_timeout_ms: env_or("CIRCUIT_RECOVERY_TIMEOUT_MS", 30_000),
            webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok(),

            log_queue_capacity: env_or("ALERT_LOG_QUEUE_CAPACITY", 1_024),
            alert_log_path: std::env::var("ALERT_LOG_PATH").ok(),

            shutdown_drain_ms: env_or("SHUTDOWN_DRAIN_MS", 5_000),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
