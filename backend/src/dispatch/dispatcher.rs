//! Notification Dispatcher
//!
//! Fans alert events out to all configured channels.
//! Responsibilities:
//!   • Per-channel circuit gating (no I/O while a circuit is open)
//!   • Bounded delivery attempts with exponential backoff, each under an
//!     explicit timeout
//!   • Per-channel failure isolation: a slow or failing channel delays
//!     neither its siblings nor later events
//!   • Delivery records for every (event, channel) pair, appended to the
//!     alert log
//!
//! Retries never re-enter the evaluation engine and never touch cooldowns.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use common::time::now_ms;

use crate::alertlog::{AlertLog, AlertLogEntry};
use crate::metrics::counters::Counters;

use super::channel::NotificationChannel;
use super::circuit::CircuitBreaker;
use super::types::{AlertEvent, DeliveryRecord, DeliveryStatus};

/// Delivery policy shared by all channels.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryPolicy {
    /// Per-attempt timeout; the only external I/O bound in the pipeline.
    pub attempt_timeout: Duration,
    /// Retries after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Backoff before retry n is `backoff_base * 2^(n-1)`.
    pub backoff_base: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/// One configured channel plus its isolation state.
///
/// The breaker is owned here and mutated only by dispatch outcomes.
#[derive(Clone)]
pub struct ChannelRuntime {
    channel: Arc<dyn NotificationChannel>,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl ChannelRuntime {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        failure_threshold: u32,
        recovery_timeout_ms: u64,
    ) -> Self {
        Self {
            channel,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(
                failure_threshold,
                recovery_timeout_ms,
            ))),
        }
    }
}

pub struct Dispatcher {
    channels: Vec<ChannelRuntime>,
    policy: DeliveryPolicy,
    log: AlertLog,
    counters: Counters,
    /// Bounds concurrently dispatching events.
    in_flight: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        channels: Vec<ChannelRuntime>,
        policy: DeliveryPolicy,
        log: AlertLog,
        counters: Counters,
        max_in_flight: usize,
    ) -> Self {
        Self {
            channels,
            policy,
            log,
            counters,
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Main dispatch loop.
    ///
    /// Each event runs on its own task so one slow fan-out cannot delay the
    /// next event; the semaphore bounds how many are in flight. Exits once
    /// the alert queue closes and in-flight deliveries finish.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<AlertEvent>) {
        info!(channels = self.channels.len(), "notification dispatcher started");

        let mut tasks = tokio::task::JoinSet::new();

        while let Some(event) = rx.recv().await {
            let Ok(permit) = self.in_flight.clone().acquire_owned().await else {
                break;
            };

            let me = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                me.dispatch_event(event).await;
            });

            // Reap finished deliveries so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        info!("notification dispatcher drained");
    }

    /// Delivers one event to every channel concurrently and records the
    /// per-channel outcomes.
    pub async fn dispatch_event(&self, event: AlertEvent) -> Vec<DeliveryRecord> {
        let records = join_all(
            self.channels
                .iter()
                .map(|runtime| self.deliver(runtime, &event)),
        )
        .await;

        for record in &records {
            match record.status {
                DeliveryStatus::Sent => self.counters.deliveries_sent.fetch_add(1, Relaxed),
                DeliveryStatus::Failed { .. } => {
                    self.counters.deliveries_failed.fetch_add(1, Relaxed)
                }
                DeliveryStatus::SkippedCircuitOpen => {
                    self.counters.deliveries_skipped_open.fetch_add(1, Relaxed)
                }
            };
        }

        self.log
            .record(AlertLogEntry::delivery(event.event_id, records.clone()));
        records
    }

    /// One channel: circuit gate, then bounded attempts with backoff.
    async fn deliver(&self, runtime: &ChannelRuntime, event: &AlertEvent) -> DeliveryRecord {
        let name = runtime.channel.name().to_string();

        if !runtime.breaker.lock().allow(now_ms()) {
            debug!(channel = %name, event_id = %event.event_id, "circuit open; delivery skipped");
            return DeliveryRecord {
                event_id: event.event_id,
                channel: name,
                status: DeliveryStatus::SkippedCircuitOpen,
                attempts: 0,
                completed_at_ms: now_ms(),
            };
        }

        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts <= self.policy.max_retries {
            if attempts > 0 {
                let backoff = self.policy.backoff_base * 2u32.saturating_pow(attempts - 1);
                tokio::time::sleep(backoff).await;
            }
            attempts += 1;

            match tokio::time::timeout(self.policy.attempt_timeout, runtime.channel.send(event))
                .await
            {
                Ok(Ok(())) => {
                    runtime.breaker.lock().on_success();
                    debug!(channel = %name, event_id = %event.event_id, attempts, "alert delivered");
                    return DeliveryRecord {
                        event_id: event.event_id,
                        channel: name,
                        status: DeliveryStatus::Sent,
                        attempts,
                        completed_at_ms: now_ms(),
                    };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timeout after {:?}", self.policy.attempt_timeout);
                }
            }
        }

        let opened = runtime.breaker.lock().on_failure(now_ms());
        if opened {
            self.counters.circuits_opened.fetch_add(1, Relaxed);
            warn!(channel = %name, "circuit opened after repeated delivery failures");
        }
        warn!(
            channel = %name,
            event_id = %event.event_id,
            attempts,
            error = %last_error,
            "delivery failed"
        );

        DeliveryRecord {
            event_id: event.event_id,
            channel: name,
            status: DeliveryStatus::Failed { reason: last_error },
            attempts,
            completed_at_ms: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alertlog::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn mk_event() -> AlertEvent {
        AlertEvent {
            event_id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            symbol: "ES".into(),
            rule_name: "breakout".into(),
            observed: 4501.0,
            threshold: Some(4500.0),
            condition: "price above 4500".into(),
            tick_ts_ms: 1_000,
            fired_at_ms: 2_000,
            eval_latency_us: 90,
        }
    }

    /// Channel that fails its first `fail_first` sends, then succeeds.
    struct FlakyChannel {
        name: &'static str,
        calls: AtomicU32,
        fail_first: u32,
    }

    impl FlakyChannel {
        fn new(name: &'static str, fail_first: u32) -> Self {
            Self {
                name,
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl NotificationChannel for FlakyChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _event: &AlertEvent) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(anyhow::anyhow!("unreachable"))
            } else {
                Ok(())
            }
        }
    }

    fn mk_dispatcher(channels: Vec<ChannelRuntime>, policy: DeliveryPolicy) -> (Dispatcher, MemorySink) {
        let sink = MemorySink::new();
        let (log, _writer) = AlertLog::spawn(Arc::new(sink.clone()), 64, Counters::default());
        (
            Dispatcher::new(channels, policy, log, Counters::default(), 8),
            sink,
        )
    }

    fn fast_policy() -> DeliveryPolicy {
        DeliveryPolicy {
            attempt_timeout: Duration::from_millis(100),
            max_retries: 1,
            backoff_base: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_transient_failure() {
        let channel = Arc::new(FlakyChannel::new("flaky", 1));
        let (dispatcher, _sink) = mk_dispatcher(
            vec![ChannelRuntime::new(channel.clone(), 5, 30_000)],
            fast_policy(),
        );

        let records = dispatcher.dispatch_event(mk_event()).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Sent);
        assert_eq!(records[0].attempts, 2);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_failure() {
        let channel = Arc::new(FlakyChannel::new("down", u32::MAX));
        let (dispatcher, _sink) = mk_dispatcher(
            vec![ChannelRuntime::new(channel, 5, 30_000)],
            fast_policy(),
        );

        let records = dispatcher.dispatch_event(mk_event()).await;

        assert!(matches!(records[0].status, DeliveryStatus::Failed { .. }));
        assert_eq!(records[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_without_attempting() {
        let channel = Arc::new(FlakyChannel::new("down", u32::MAX));
        let runtime = ChannelRuntime::new(channel.clone(), 1, 60_000);
        let (dispatcher, _sink) = mk_dispatcher(vec![runtime], fast_policy());

        // First event exhausts retries and opens the circuit (threshold 1).
        let first = dispatcher.dispatch_event(mk_event()).await;
        assert!(matches!(first[0].status, DeliveryStatus::Failed { .. }));
        let calls_after_first = channel.calls.load(Ordering::SeqCst);

        // Second event: no I/O at all.
        let second = dispatcher.dispatch_event(mk_event()).await;
        assert_eq!(second[0].status, DeliveryStatus::SkippedCircuitOpen);
        assert_eq!(second[0].attempts, 0);
        assert_eq!(channel.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_channel_does_not_affect_healthy_sibling() {
        let bad = Arc::new(FlakyChannel::new("bad", u32::MAX));
        let good = Arc::new(FlakyChannel::new("good", 0));
        let (dispatcher, _sink) = mk_dispatcher(
            vec![
                ChannelRuntime::new(bad, 1, 60_000),
                ChannelRuntime::new(good.clone(), 1, 60_000),
            ],
            fast_policy(),
        );

        // Open the bad channel's circuit.
        dispatcher.dispatch_event(mk_event()).await;

        // Subsequent events keep flowing to the healthy channel.
        for _ in 0..3 {
            let records = dispatcher.dispatch_event(mk_event()).await;
            let by_name: std::collections::HashMap<_, _> = records
                .iter()
                .map(|r| (r.channel.clone(), r.status.clone()))
                .collect();

            assert_eq!(by_name["bad"], DeliveryStatus::SkippedCircuitOpen);
            assert_eq!(by_name["good"], DeliveryStatus::Sent);
        }
        assert_eq!(good.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_records_reach_the_alert_log() {
        let channel = Arc::new(FlakyChannel::new("ok", 0));
        let sink = MemorySink::new();
        let (log, writer) = AlertLog::spawn(Arc::new(sink.clone()), 64, Counters::default());
        let dispatcher = Dispatcher::new(
            vec![ChannelRuntime::new(channel, 5, 30_000)],
            fast_policy(),
            log.clone(),
            Counters::default(),
            8,
        );

        let event = mk_event();
        let event_id = event.event_id;
        dispatcher.dispatch_event(event).await;

        drop(dispatcher);
        drop(log);
        writer.await.unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        match &entries[0] {
            crate::alertlog::AlertLogEntry::Delivery {
                event_id: logged,
                records,
                ..
            } => {
                assert_eq!(*logged, event_id);
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].status, DeliveryStatus::Sent);
            }
            other => panic!("expected delivery entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_drains_queue_then_exits() {
        let channel = Arc::new(FlakyChannel::new("ok", 0));
        let (dispatcher, _sink) = mk_dispatcher(
            vec![ChannelRuntime::new(channel.clone(), 5, 30_000)],
            fast_policy(),
        );

        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::new(dispatcher).run(rx));

        for _ in 0..3 {
            tx.send(mk_event()).await.unwrap();
        }
        drop(tx);

        handle.await.unwrap();
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }
}
