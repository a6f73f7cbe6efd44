use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use backend::{
    alertlog::{AlertLog, AlertSink, JsonlSink, MemorySink},
    config::AppConfig,
    dispatch::{
        channel::{BellChannel, BroadcastChannel, WebhookChannel},
        dispatcher::{ChannelRuntime, DeliveryPolicy, Dispatcher},
        types::AlertEvent,
    },
    engine::TickRouter,
    market::{
        normalizer::{TickNormalizer, WatermarkView, run_normalizer},
        types::{Instrument, InstrumentKind, InstrumentRegistry},
    },
    metrics::counters::Counters,
    rules::{model::AlertRule, store::RuleStore},
};
use common::logger::init_logger;

/// Loads the tracked-instrument set from `TRACKED_SYMBOLS` (comma-separated,
/// single-operator bootstrap). Instrument CRUD beyond this is an external
/// management concern.
fn bootstrap_instruments(registry: &InstrumentRegistry) {
    let symbols = std::env::var("TRACKED_SYMBOLS").unwrap_or_else(|_| "ES,NQ,YM".to_string());
    for symbol in symbols.split(',') {
        let symbol = symbol.trim();
        if !symbol.is_empty() {
            registry.track(Instrument::new(symbol, InstrumentKind::Future));
        }
    }
    tracing::info!(symbols = ?registry.symbols(), "tracking instruments");
}

/// Loads trigger rules from a JSON file. Invalid configurations are kept as
/// health-flagged rules by the store, not rejected here.
async fn load_rules(store: &RuleStore, path: &str) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read rules file {path}"))?;

    let rules: Vec<AlertRule> =
        serde_json::from_str(&raw).context("rules file is not a JSON array of rules")?;

    let count = rules.len();
    for rule in rules {
        store.upsert_rule(rule);
    }
    tracing::info!(count, path, "rules loaded");
    Ok(())
}

/// Builds the configured notification channels and starts the dispatcher.
fn start_dispatcher(
    cfg: &AppConfig,
    log: AlertLog,
    counters: Counters,
    alert_rx: mpsc::Receiver<AlertEvent>,
) -> anyhow::Result<JoinHandle<()>> {
    let threshold = cfg.circuit_failure_threshold;
    let recovery = cfg.circuit_recovery_timeout_ms;

    let mut channels = vec![
        ChannelRuntime::new(Arc::new(BroadcastChannel::new(64)), threshold, recovery),
        ChannelRuntime::new(Arc::new(BellChannel), threshold, recovery),
    ];

    if let Some(url) = &cfg.webhook_url {
        let webhook = WebhookChannel::new(
            url.clone(),
            Duration::from_millis(cfg.dispatch_attempt_timeout_ms),
        )?;
        channels.push(ChannelRuntime::new(Arc::new(webhook), threshold, recovery));
        tracing::info!(url = %url, "webhook channel configured");
    }

    let policy = DeliveryPolicy {
        attempt_timeout: Duration::from_millis(cfg.dispatch_attempt_timeout_ms),
        max_retries: cfg.dispatch_max_retries,
        backoff_base: Duration::from_millis(cfg.dispatch_backoff_base_ms),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        channels,
        policy,
        log,
        counters,
        cfg.dispatch_max_in_flight,
    ));
    Ok(tokio::spawn(dispatcher.run(alert_rx)))
}

/// Reads NDJSON tick payloads from stdin and feeds the ingest queue.
/// Stands in for the external market-data connector.
fn start_stdin_feed(tx: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "tick feed read failed");
                    break;
                }
            }
        }
        tracing::info!("tick feed ended");
    })
}

/// Periodic health report: per-instrument watermarks plus pipeline counters.
fn start_health_reporter(
    watermarks: WatermarkView,
    counters: Counters,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            tracing::info!(
                target: "health",
                watermarks = ?watermarks.snapshot(),
                ticks_accepted = counters.ticks_accepted.load(Relaxed),
                ticks_malformed = counters.ticks_malformed.load(Relaxed),
                ticks_stale = counters.ticks_stale.load(Relaxed),
                ticks_dropped = counters.ticks_dropped_backpressure.load(Relaxed),
                alerts_fired = counters.alerts_fired.load(Relaxed),
                alerts_suppressed = counters.alerts_suppressed.load(Relaxed),
                deliveries_sent = counters.deliveries_sent.load(Relaxed),
                deliveries_failed = counters.deliveries_failed.load(Relaxed),
                circuits_opened = counters.circuits_opened.load(Relaxed),
                "pipeline health"
            );
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_logger("tick-alert-engine", is_production);

    let cfg = AppConfig::from_env();
    tracing::info!("starting tick alert engine");

    let counters = Counters::default();
    let registry = InstrumentRegistry::new();
    bootstrap_instruments(&registry);

    let sink: Arc<dyn AlertSink> = match &cfg.alert_log_path {
        Some(path) => Arc::new(JsonlSink::create(path).await?),
        None => Arc::new(MemorySink::new()),
    };
    let (log, log_writer) = AlertLog::spawn(sink, cfg.log_queue_capacity, counters.clone());

    let store = Arc::new(RuleStore::new(counters.clone()));
    if let Ok(path) = std::env::var("RULES_PATH") {
        load_rules(&store, &path).await?;
    }

    let (alert_tx, alert_rx) = mpsc::channel(cfg.alert_queue_capacity);
    let router = Arc::new(TickRouter::new(
        store.clone(),
        alert_tx,
        log.clone(),
        counters.clone(),
        cfg.instrument_queue_capacity,
    ));

    let dispatcher_handle = start_dispatcher(&cfg, log.clone(), counters.clone(), alert_rx)?;

    let watermarks = WatermarkView::new();
    let (raw_tx, raw_rx) = mpsc::channel(cfg.ingest_queue_capacity);
    let (tick_tx, _) = broadcast::channel(256);

    let normalizer = TickNormalizer::new(registry.clone(), watermarks.clone(), counters.clone());
    let normalizer_handle = tokio::spawn(run_normalizer(
        normalizer,
        raw_rx,
        router.clone(),
        tick_tx,
    ));

    let feed_handle = start_stdin_feed(raw_tx);
    let health_handle = start_health_reporter(watermarks, counters, Duration::from_secs(30));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received; draining pipeline");

    // Stop accepting input; in-flight work drains stage by stage below.
    feed_handle.abort();
    health_handle.abort();

    let drain = async move {
        // Feed sender gone -> normalizer drains and exits.
        let _ = normalizer_handle.await;
        // Close instrument queues, evaluate the backlog.
        router.shutdown().await;
        // Releasing the engine's alert sender closes the dispatcher queue.
        drop(router);
        let _ = dispatcher_handle.await;
        // Last log sender gone -> writer flushes the buffer.
        drop(log);
        let _ = log_writer.await;
    };

    if tokio::time::timeout(Duration::from_millis(cfg.shutdown_drain_ms), drain)
        .await
        .is_err()
    {
        tracing::warn!("drain exceeded shutdown deadline; exiting with pending work");
    }

    tracing::info!("shutdown complete");
    Ok(())
}
