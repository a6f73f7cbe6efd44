//! Tick Normalizer
//!
//! Converts raw provider payloads into canonical `Tick` records.
//! Responsibilities:
//!   • Reject malformed payloads (missing fields, non-numeric values)
//!   • Reject ticks for untracked or inactive instruments
//!   • Enforce per-instrument timestamp monotonicity via a watermark
//!   • Forward valid ticks to the per-instrument router and the broadcast
//!
//! Every rejection is counted and logged; nothing here is retried and no
//! rejection propagates as a task failure. Upstream reconnection is an
//! external concern.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::engine::TickRouter;
use crate::error::NormalizeError;
use crate::market::types::{InstrumentRegistry, RawTick, Tick};
use crate::metrics::counters::Counters;

/// Shared view of the per-instrument "last seen" watermarks.
///
/// Written by the normalizer on every accepted tick; read by staleness
/// checks and by external health reporting.
#[derive(Clone, Default)]
pub struct WatermarkView {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl WatermarkView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<u64> {
        self.inner.lock().get(symbol).copied()
    }

    fn advance(&self, symbol: &str, ts_ms: u64) {
        self.inner.lock().insert(symbol.to_string(), ts_ms);
    }

    /// Snapshot for health reporting, sorted by symbol.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        out
    }
}

/// Converts raw provider payloads into canonical ticks.
pub struct TickNormalizer {
    registry: InstrumentRegistry,
    watermarks: WatermarkView,
    counters: Counters,
}

impl TickNormalizer {
    pub fn new(registry: InstrumentRegistry, watermarks: WatermarkView, counters: Counters) -> Self {
        Self {
            registry,
            watermarks,
            counters,
        }
    }

    /// Parses and validates one raw payload.
    ///
    /// Accepting a tick advances the instrument's watermark, so a second
    /// tick with the same timestamp is rejected as stale (duplicate input
    /// yields at most one evaluation pass downstream).
    pub fn normalize(&mut self, payload: &str) -> Result<Tick, NormalizeError> {
        let raw: RawTick = serde_json::from_str(payload)
            .map_err(|e| NormalizeError::MalformedInput(e.to_string()))?;

        let symbol = raw
            .symbol
            .ok_or_else(|| NormalizeError::MalformedInput("missing symbol".into()))?;
        let ts_ms = raw
            .ts_ms
            .ok_or_else(|| NormalizeError::MalformedInput("missing ts_ms".into()))?;
        let price = raw
            .price
            .ok_or_else(|| NormalizeError::MalformedInput("missing price".into()))?;
        let volume = raw
            .volume
            .ok_or_else(|| NormalizeError::MalformedInput("missing volume".into()))?;

        if !price.is_finite() || price <= 0.0 {
            return Err(NormalizeError::MalformedInput(format!(
                "non-positive price {price}"
            )));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(NormalizeError::MalformedInput(format!(
                "negative volume {volume}"
            )));
        }

        let instrument = self
            .registry
            .get(&symbol)
            .ok_or_else(|| NormalizeError::UntrackedInstrument(symbol.clone()))?;
        if !instrument.is_active() {
            return Err(NormalizeError::InactiveInstrument(symbol));
        }

        if let Some(watermark_ms) = self.watermarks.get(&symbol) {
            if ts_ms <= watermark_ms {
                return Err(NormalizeError::StaleTick {
                    symbol,
                    ts_ms,
                    watermark_ms,
                });
            }
        }
        self.watermarks.advance(&symbol, ts_ms);

        Ok(Tick {
            symbol,
            ts_ms,
            price,
            volume,
            bid: raw.bid,
            ask: raw.ask,
        })
    }

    fn reject(&self, err: &NormalizeError) {
        match err {
            NormalizeError::MalformedInput(_) => {
                self.counters.ticks_malformed.fetch_add(1, Relaxed);
                warn!(error = %err, "malformed tick payload dropped");
            }
            NormalizeError::StaleTick { .. } => {
                self.counters.ticks_stale.fetch_add(1, Relaxed);
                debug!(error = %err, "stale tick dropped");
            }
            NormalizeError::UntrackedInstrument(_) | NormalizeError::InactiveInstrument(_) => {
                self.counters.ticks_untracked.fetch_add(1, Relaxed);
                debug!(error = %err, "tick for untracked instrument dropped");
            }
        }
    }
}

/// Normalizer stage: drains raw payloads, forwards valid ticks to the
/// per-instrument router and to the tick broadcast for external
/// subscribers. Exits when the inbound queue closes (shutdown).
pub async fn run_normalizer(
    mut normalizer: TickNormalizer,
    mut raw_rx: mpsc::Receiver<String>,
    router: Arc<TickRouter>,
    tick_tx: broadcast::Sender<Tick>,
) {
    info!("tick normalizer started");

    while let Some(payload) = raw_rx.recv().await {
        match normalizer.normalize(&payload) {
            Ok(tick) => {
                normalizer.counters.ticks_accepted.fetch_add(1, Relaxed);
                // Zero live subscribers is fine; publication is best-effort.
                let _ = tick_tx.send(tick.clone());
                router.route(tick);
            }
            Err(e) => normalizer.reject(&e),
        }
    }

    info!("tick normalizer drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{Instrument, InstrumentKind, InstrumentStatus};
    use proptest::prelude::*;

    fn mk_normalizer() -> TickNormalizer {
        let registry = InstrumentRegistry::new();
        registry.track(Instrument::new("ES", InstrumentKind::Future));
        registry.track(Instrument::new("NK", InstrumentKind::Index));
        registry.set_status("NK", InstrumentStatus::Inactive);
        TickNormalizer::new(registry, WatermarkView::new(), Counters::default())
    }

    fn payload(symbol: &str, ts_ms: u64, price: f64, volume: f64) -> String {
        format!(r#"{{"symbol":"{symbol}","ts_ms":{ts_ms},"price":{price},"volume":{volume}}}"#)
    }

    #[test]
    fn accepts_valid_payload_and_advances_watermark() {
        let mut n = mk_normalizer();

        let tick = n.normalize(&payload("ES", 1_000, 4500.25, 12.0)).unwrap();
        assert_eq!(tick.symbol, "ES");
        assert_eq!(tick.ts_ms, 1_000);
        assert_eq!(n.watermarks.get("ES"), Some(1_000));
    }

    #[test]
    fn rejects_missing_fields() {
        let mut n = mk_normalizer();

        let err = n.normalize(r#"{"symbol":"ES","ts_ms":1}"#).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedInput(_)));
    }

    #[test]
    fn rejects_non_numeric_price() {
        let mut n = mk_normalizer();

        let err = n
            .normalize(r#"{"symbol":"ES","ts_ms":1,"price":"abc","volume":1}"#)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedInput(_)));
    }

    #[test]
    fn rejects_non_positive_price() {
        let mut n = mk_normalizer();

        let err = n.normalize(&payload("ES", 1, -4.0, 1.0)).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedInput(_)));
    }

    #[test]
    fn rejects_duplicate_and_out_of_order_timestamps() {
        let mut n = mk_normalizer();

        n.normalize(&payload("ES", 2_000, 4500.0, 1.0)).unwrap();

        let dup = n.normalize(&payload("ES", 2_000, 4500.0, 1.0)).unwrap_err();
        assert!(matches!(dup, NormalizeError::StaleTick { .. }));

        let older = n.normalize(&payload("ES", 1_999, 4500.0, 1.0)).unwrap_err();
        assert!(matches!(older, NormalizeError::StaleTick { .. }));

        // Watermark is unchanged by rejected input.
        assert_eq!(n.watermarks.get("ES"), Some(2_000));
    }

    #[test]
    fn rejects_untracked_and_inactive_instruments() {
        let mut n = mk_normalizer();

        let untracked = n.normalize(&payload("CL", 1, 80.0, 1.0)).unwrap_err();
        assert!(matches!(untracked, NormalizeError::UntrackedInstrument(_)));

        let inactive = n.normalize(&payload("NK", 1, 38_000.0, 1.0)).unwrap_err();
        assert!(matches!(inactive, NormalizeError::InactiveInstrument(_)));
    }

    proptest! {
        /// Whatever two timestamps arrive, the second is only accepted when
        /// strictly newer.
        #[test]
        fn watermark_enforces_strict_monotonicity(a in 1u64..1_000_000, b in 1u64..1_000_000) {
            let mut n = mk_normalizer();
            n.normalize(&payload("ES", a, 100.0, 1.0)).unwrap();

            let second = n.normalize(&payload("ES", b, 100.0, 1.0));
            if b > a {
                prop_assert!(second.is_ok());
            } else {
                prop_assert!(matches!(second.unwrap_err(), NormalizeError::StaleTick { .. }), "expected StaleTick");
            }
        }
    }
}
