use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuleConfigError;

/// Direction for level conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Above,
    Below,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Above => write!(f, "above"),
            Condition::Below => write!(f, "below"),
        }
    }
}

/// Direction for moving-average crossovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDirection {
    CrossesAbove,
    CrossesBelow,
}

/// Combinator for `Combined` rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOp {
    All,
    Any,
}

/// Closed set of trigger kinds.
///
/// Each kind reduces to a level boolean against per-rule state; the engine
/// applies edge detection and cooldown uniformly on top, so adding a kind
/// is additive and never touches the firing logic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Price compared against a static level.
    Threshold { condition: Condition, threshold: f64 },

    /// Price crossing its own simple moving average of `period` samples.
    MovingAverageCross {
        direction: CrossDirection,
        period: usize,
    },

    /// Percent change of price over a trailing time horizon.
    RateOfChange {
        condition: Condition,
        threshold_pct: f64,
        window_ms: u64,
    },

    /// Volume at a multiple of its rolling baseline (previous `period`
    /// ticks, the current tick excluded).
    VolumeSpike { period: usize, multiplier: f64 },

    /// AND/OR combination of leaf conditions. One level deep only.
    Combined { op: CombineOp, subs: Vec<RuleKind> },
}

impl RuleKind {
    /// Validates configuration parameters for this kind.
    pub fn validate(&self) -> Result<(), RuleConfigError> {
        match self {
            RuleKind::Threshold { threshold, .. } => {
                if !threshold.is_finite() {
                    return Err(RuleConfigError::NonFiniteThreshold);
                }
                Ok(())
            }
            RuleKind::MovingAverageCross { period, .. } => {
                if *period < 2 {
                    return Err(RuleConfigError::PeriodTooShort);
                }
                Ok(())
            }
            RuleKind::RateOfChange {
                threshold_pct,
                window_ms,
                ..
            } => {
                if *window_ms == 0 {
                    return Err(RuleConfigError::EmptyWindow);
                }
                if !threshold_pct.is_finite() {
                    return Err(RuleConfigError::NonFiniteThreshold);
                }
                Ok(())
            }
            RuleKind::VolumeSpike { period, multiplier } => {
                if *period < 2 {
                    return Err(RuleConfigError::PeriodTooShort);
                }
                if !multiplier.is_finite() || *multiplier <= 0.0 {
                    return Err(RuleConfigError::InvalidMultiplier);
                }
                Ok(())
            }
            RuleKind::Combined { subs, .. } => {
                if subs.is_empty() {
                    return Err(RuleConfigError::EmptyCombination);
                }
                for sub in subs {
                    if matches!(sub, RuleKind::Combined { .. }) {
                        return Err(RuleConfigError::NestedCombination);
                    }
                    sub.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Human-readable condition description used in alert payloads and log
    /// entries.
    pub fn describe(&self) -> String {
        match self {
            RuleKind::Threshold {
                condition,
                threshold,
            } => format!("price {condition} {threshold}"),
            RuleKind::MovingAverageCross { direction, period } => {
                let dir = match direction {
                    CrossDirection::CrossesAbove => "crosses above",
                    CrossDirection::CrossesBelow => "crosses below",
                };
                format!("price {dir} MA({period})")
            }
            RuleKind::RateOfChange {
                condition,
                threshold_pct,
                window_ms,
            } => format!("change over {window_ms}ms {condition} {threshold_pct}%"),
            RuleKind::VolumeSpike { period, multiplier } => {
                format!("volume at {multiplier}x the {period}-tick average")
            }
            RuleKind::Combined { op, subs } => {
                let sep = match op {
                    CombineOp::All => " AND ",
                    CombineOp::Any => " OR ",
                };
                subs.iter()
                    .map(RuleKind::describe)
                    .collect::<Vec<_>>()
                    .join(sep)
            }
        }
    }
}

/// A user-defined trigger rule for one instrument.
///
/// Created and updated through the external management interface; the
/// engine never mutates a rule, only its own evaluation state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: Uuid,
    pub symbol: String,
    pub name: String,
    pub kind: RuleKind,
    pub active: bool,

    /// Minimum stream-time between two fires, in milliseconds.
    #[serde(default)]
    pub cooldown_ms: u64,

    /// Bumped by the store on every upsert; the engine rebuilds evaluation
    /// state when it changes, so a reloaded rule starts detection clean.
    #[serde(default)]
    pub revision: u64,
}

impl AlertRule {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>, kind: RuleKind) -> Self {
        Self {
            rule_id: Uuid::new_v4(),
            symbol: symbol.into(),
            name: name.into(),
            kind,
            active: true,
            cooldown_ms: 0,
            revision: 0,
        }
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }
}
