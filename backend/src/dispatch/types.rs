use serde::Serialize;
use uuid::Uuid;

/// A single rule firing.
///
/// Produced exactly once by the evaluation engine when an edge passes its
/// cooldown; immutable afterwards. Retries and fan-out downstream reuse the
/// same event.
#[derive(Clone, Debug, Serialize)]
pub struct AlertEvent {
    pub event_id: Uuid,
    pub rule_id: Uuid,
    pub symbol: String,
    pub rule_name: String,

    /// Value that satisfied the condition (price, percent change, volume).
    pub observed: f64,
    /// Threshold the value was compared against, when the kind has one.
    pub threshold: Option<f64>,
    /// Human-readable condition, e.g. "price above 4500".
    pub condition: String,

    /// Timestamp of the tick that caused the firing (stream clock).
    pub tick_ts_ms: u64,
    /// Wall-clock time the engine fired the event.
    pub fired_at_ms: u64,
    /// Time from tick dequeue to event emission.
    pub eval_latency_us: u64,
}

/// Delivery outcome for one (event, channel) pair. Append-only; flows to
/// the alert log.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DeliveryRecord {
    pub event_id: Uuid,
    pub channel: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub completed_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    /// All bounded attempts failed or timed out.
    Failed { reason: String },
    /// No attempt was made because the channel's circuit was open.
    SkippedCircuitOpen,
}
