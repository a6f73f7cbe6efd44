use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Classification of a tracked instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Future,
    Index,
    Internal,
}

/// Lifecycle status. Mutated only through the registry's write path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    Active,
    Inactive,
}

/// A tracked instrument. Identity (`symbol`) is immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub kind: InstrumentKind,
    pub status: InstrumentStatus,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, kind: InstrumentKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            status: InstrumentStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstrumentStatus::Active
    }
}

/// Registry of tracked instruments, shared between the normalizer (reads,
/// once per payload) and the external management interface (writes,
/// infrequent).
#[derive(Clone, Default)]
pub struct InstrumentRegistry {
    inner: Arc<RwLock<HashMap<String, Instrument>>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, instrument: Instrument) {
        self.inner
            .write()
            .insert(instrument.symbol.clone(), instrument);
    }

    /// Returns false when the symbol is not tracked.
    pub fn set_status(&self, symbol: &str, status: InstrumentStatus) -> bool {
        match self.inner.write().get_mut(symbol) {
            Some(i) => {
                i.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Instrument> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.read().keys().cloned().collect();
        out.sort();
        out
    }
}

/// Raw provider payload as it arrives on the wire.
///
/// All fields are optional so shape problems surface as `MalformedInput`
/// at the normalizer boundary rather than aborting the whole batch.
#[derive(Clone, Debug, Deserialize)]
pub struct RawTick {
    pub symbol: Option<String>,
    pub ts_ms: Option<u64>,
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

/// Canonical tick observed by the evaluation engine.
///
/// Invariant: for a given symbol, `ts_ms` is strictly increasing as seen by
/// the engine; the normalizer drops anything not newer than its watermark.
#[derive(Clone, Debug, Serialize)]
pub struct Tick {
    pub symbol: String,
    pub ts_ms: u64,
    pub price: f64,
    pub volume: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}
