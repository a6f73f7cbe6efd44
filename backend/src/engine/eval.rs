//! Rule condition evaluation.
//!
//! Every rule kind reduces to a *level* boolean over its rolling state:
//! crossovers are expressed as the price-vs-average relation, so a cross is
//! exactly a false→true transition of that relation. Edge detection and
//! cooldown are then applied uniformly in `apply_edge`, regardless of kind.
//!
//! Computation here is pure and deterministic given (tick, state). Any I/O
//! lives outside this module.

use crate::error::EvalError;
use crate::market::types::Tick;
use crate::rules::model::{CombineOp, Condition, CrossDirection, RuleKind};

use super::state::{KindState, RuleEvalState};

/// Result of computing a rule's condition against one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Signal {
    /// Not enough history yet. No edge detection is possible, and `prev`
    /// stays untouched so the first real result arms cleanly.
    Warming,

    /// Condition evaluated. `observed` and `threshold` feed alert payloads
    /// and log entries.
    Level {
        active: bool,
        observed: f64,
        threshold: Option<f64>,
    },
}

/// What the engine should do with a rule after one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeDecision {
    None,
    Fire,
    Suppress,
}

/// Updates `state` with the tick and computes the current level condition.
pub fn evaluate_kind(
    kind: &RuleKind,
    state: &mut KindState,
    tick: &Tick,
) -> Result<Signal, EvalError> {
    match (kind, state) {
        (
            RuleKind::Threshold {
                condition,
                threshold,
            },
            KindState::Threshold,
        ) => {
            let active = match condition {
                Condition::Above => tick.price > *threshold,
                Condition::Below => tick.price < *threshold,
            };
            Ok(Signal::Level {
                active,
                observed: tick.price,
                threshold: Some(*threshold),
            })
        }

        (
            RuleKind::MovingAverageCross { direction, period },
            KindState::MovingAverageCross { window },
        ) => {
            window.push(tick.ts_ms, tick.price);
            if window.len() < *period {
                return Ok(Signal::Warming);
            }
            let Some(ma) = window.mean() else {
                return Ok(Signal::Warming);
            };
            if !ma.is_finite() {
                return Err(EvalError::NonFinite("moving average"));
            }

            let active = match direction {
                CrossDirection::CrossesAbove => tick.price > ma,
                CrossDirection::CrossesBelow => tick.price < ma,
            };
            Ok(Signal::Level {
                active,
                observed: tick.price,
                threshold: Some(ma),
            })
        }

        (
            RuleKind::RateOfChange {
                condition,
                threshold_pct,
                window_ms,
            },
            KindState::RateOfChange { window },
        ) => {
            window.push(tick.ts_ms, tick.price);

            let anchor_ts = tick.ts_ms.saturating_sub(*window_ms);
            let Some(base) = window.value_at_or_before(anchor_ts) else {
                return Ok(Signal::Warming);
            };
            if base <= 0.0 {
                // The normalizer rejects non-positive prices; a zero anchor
                // would only come from corrupted state.
                return Err(EvalError::NonFinite("rate-of-change baseline"));
            }

            let pct = (tick.price - base) / base * 100.0;
            if !pct.is_finite() {
                return Err(EvalError::NonFinite("rate-of-change"));
            }

            let active = match condition {
                Condition::Above => pct > *threshold_pct,
                Condition::Below => pct < *threshold_pct,
            };
            Ok(Signal::Level {
                active,
                observed: pct,
                threshold: Some(*threshold_pct),
            })
        }

        (RuleKind::VolumeSpike { period, multiplier }, KindState::VolumeSpike { window }) => {
            // Baseline over the previous `period` ticks, excluding the
            // current one, so the spike cannot dilute its own baseline.
            let baseline = if window.len() >= *period {
                window.mean()
            } else {
                None
            };
            window.push(tick.ts_ms, tick.volume);

            match baseline {
                Some(avg) if avg > 0.0 => {
                    let threshold = avg * *multiplier;
                    if !threshold.is_finite() {
                        return Err(EvalError::NonFinite("volume baseline"));
                    }
                    Ok(Signal::Level {
                        active: tick.volume >= threshold,
                        observed: tick.volume,
                        threshold: Some(threshold),
                    })
                }
                _ => Ok(Signal::Warming),
            }
        }

        (RuleKind::Combined { op, subs }, KindState::Combined { subs: sub_states }) => {
            if subs.len() != sub_states.len() {
                return Err(EvalError::StateMismatch);
            }

            // Every sub-state must be updated with the tick even when the
            // combined result is still warming, or later results would be
            // computed over partial history.
            let mut all_warm = true;
            let mut actives = Vec::with_capacity(subs.len());
            for (sub_kind, sub_state) in subs.iter().zip(sub_states.iter_mut()) {
                match evaluate_kind(sub_kind, sub_state, tick)? {
                    Signal::Warming => all_warm = false,
                    Signal::Level { active, .. } => actives.push(active),
                }
            }
            if !all_warm {
                return Ok(Signal::Warming);
            }

            let active = match op {
                CombineOp::All => actives.iter().all(|a| *a),
                CombineOp::Any => actives.iter().any(|a| *a),
            };
            Ok(Signal::Level {
                active,
                observed: tick.price,
                threshold: None,
            })
        }

        // States are constructed from the rule's own kind; reaching this arm
        // means the pairing was corrupted somewhere.
        _ => Err(EvalError::StateMismatch),
    }
}

/// Applies edge detection and cooldown on top of a level signal, updating
/// `prev` and `last_triggered_ms` in place.
///
/// All rule kinds are edge-triggered on their boolean condition: a fire
/// requires the stored previous result to be `false`. A fresh state
/// (`prev == None`) arms without firing, so a rule created while its
/// condition already holds stays quiet until the condition re-asserts.
/// Cooldown runs on the stream clock (`now_ms` is the tick timestamp);
/// a suppressed fire leaves `last_triggered_ms` untouched.
pub fn apply_edge(
    state: &mut RuleEvalState,
    signal: Signal,
    cooldown_ms: u64,
    now_ms: u64,
) -> EdgeDecision {
    let Signal::Level { active, .. } = signal else {
        return EdgeDecision::None;
    };

    let edge = state.prev == Some(false) && active;
    state.prev = Some(active);

    if !edge {
        return EdgeDecision::None;
    }

    let cooled = state
        .last_triggered_ms
        .is_none_or(|t| now_ms.saturating_sub(t) >= cooldown_ms);

    if cooled {
        state.last_triggered_ms = Some(now_ms);
        EdgeDecision::Fire
    } else {
        EdgeDecision::Suppress
    }
}
