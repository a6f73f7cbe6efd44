//! Alert Log
//!
//! Append-only record of every evaluation outcome and every delivery
//! fan-out. The log never blocks the evaluation engine or the dispatcher:
//! `record` is a bounded `try_send` and a dedicated writer task drains
//! entries into the configured sink. A lost or failed log entry is reported
//! and counted but never un-fires an alert; the authoritative firing
//! decision is the engine's.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::time::now_ms;

use crate::dispatch::types::{AlertEvent, DeliveryRecord};
use crate::market::types::Tick;
use crate::metrics::counters::Counters;
use crate::rules::model::AlertRule;

/// Outcome of one rule evaluation worth recording. Ticks where the
/// condition is simply false (or still warming) are not outcomes.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvalOutcome {
    Fired {
        event_id: Uuid,
        observed: f64,
        threshold: Option<f64>,
        eval_latency_us: u64,
    },
    /// Condition transitioned but cooldown had not elapsed. Logged, never
    /// dispatched.
    Suppressed { observed: f64 },
    Error { reason: String },
}

/// One append-only journal entry. Evaluation entries come from the engine
/// at decision time; delivery entries from the dispatcher after fan-out,
/// keyed back to the event id.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertLogEntry {
    Evaluation {
        at_ms: u64,
        symbol: String,
        rule_id: Uuid,
        rule_name: String,
        tick_ts_ms: u64,
        outcome: EvalOutcome,
    },
    Delivery {
        at_ms: u64,
        event_id: Uuid,
        records: Vec<DeliveryRecord>,
    },
}

impl AlertLogEntry {
    pub fn fired(event: &AlertEvent) -> Self {
        AlertLogEntry::Evaluation {
            at_ms: now_ms(),
            symbol: event.symbol.clone(),
            rule_id: event.rule_id,
            rule_name: event.rule_name.clone(),
            tick_ts_ms: event.tick_ts_ms,
            outcome: EvalOutcome::Fired {
                event_id: event.event_id,
                observed: event.observed,
                threshold: event.threshold,
                eval_latency_us: event.eval_latency_us,
            },
        }
    }

    pub fn suppressed(rule: &AlertRule, tick: &Tick, observed: f64) -> Self {
        AlertLogEntry::Evaluation {
            at_ms: now_ms(),
            symbol: rule.symbol.clone(),
            rule_id: rule.rule_id,
            rule_name: rule.name.clone(),
            tick_ts_ms: tick.ts_ms,
            outcome: EvalOutcome::Suppressed { observed },
        }
    }

    pub fn evaluation_error(rule: &AlertRule, tick: &Tick, reason: String) -> Self {
        AlertLogEntry::Evaluation {
            at_ms: now_ms(),
            symbol: rule.symbol.clone(),
            rule_id: rule.rule_id,
            rule_name: rule.name.clone(),
            tick_ts_ms: tick.ts_ms,
            outcome: EvalOutcome::Error { reason },
        }
    }

    pub fn delivery(event_id: Uuid, records: Vec<DeliveryRecord>) -> Self {
        AlertLogEntry::Delivery {
            at_ms: now_ms(),
            event_id,
            records,
        }
    }
}

/// Append-only sink behind the writer task.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn append(&self, entry: &AlertLogEntry) -> anyhow::Result<()>;
}

/// In-memory sink for tests and live reporting surfaces.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<AlertLogEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AlertLogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn append(&self, entry: &AlertLogEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Append-only JSON-lines file sink.
pub struct JsonlSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;

        info!(path = %path.as_ref().display(), "alert log sink opened");
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }
}

#[async_trait]
impl AlertSink for JsonlSink {
    async fn append(&self, entry: &AlertLogEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Handle used by the engine and the dispatcher.
#[derive(Clone)]
pub struct AlertLog {
    tx: mpsc::Sender<AlertLogEntry>,
    counters: Counters,
}

impl AlertLog {
    /// Spawns the writer task. The returned join handle completes once all
    /// `AlertLog` clones are dropped and the queue has drained, which is
    /// how shutdown flushes the buffer.
    pub fn spawn(
        sink: Arc<dyn AlertSink>,
        capacity: usize,
        counters: Counters,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AlertLogEntry>(capacity);

        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.append(&entry).await {
                    // Reported, never fatal: the firing decision already
                    // happened upstream.
                    error!(error = %e, "alert log append failed");
                }
            }
            info!("alert log writer drained");
        });

        (Self { tx, counters }, handle)
    }

    /// Non-blocking append. A full queue drops the entry, visibly.
    pub fn record(&self, entry: AlertLogEntry) {
        if self.tx.try_send(entry).is_err() {
            self.counters.log_entries_dropped.fetch_add(1, Relaxed);
            warn!("alert log queue full; entry dropped");
        }
    }
}
