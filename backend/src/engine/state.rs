use crate::market::rolling_window::RollingWindow;
use crate::rules::model::{AlertRule, RuleKind};

/// Per-kind rolling state. Mirrors the shape of `RuleKind`, one level deep.
#[derive(Clone, Debug)]
pub enum KindState {
    Threshold,
    MovingAverageCross { window: RollingWindow },
    RateOfChange { window: RollingWindow },
    VolumeSpike { window: RollingWindow },
    Combined { subs: Vec<KindState> },
}

impl KindState {
    pub fn for_kind(kind: &RuleKind) -> Self {
        match kind {
            RuleKind::Threshold { .. } => KindState::Threshold,
            RuleKind::MovingAverageCross { period, .. } => KindState::MovingAverageCross {
                window: RollingWindow::with_max_samples(*period),
            },
            // Retains twice the horizon so an anchor sample at or before
            // `now - window_ms` exists once the stream is old enough.
            RuleKind::RateOfChange { window_ms, .. } => KindState::RateOfChange {
                window: RollingWindow::with_max_age(window_ms.saturating_mul(2)),
            },
            RuleKind::VolumeSpike { period, .. } => KindState::VolumeSpike {
                window: RollingWindow::with_max_samples(*period),
            },
            RuleKind::Combined { subs, .. } => KindState::Combined {
                subs: subs.iter().map(Self::for_kind).collect(),
            },
        }
    }
}

/// Evaluation state owned exclusively by the engine, one per active rule.
///
/// Created when the rule first appears in a snapshot, rebuilt when its
/// revision changes, discarded when it leaves the snapshot. `prev` is the
/// previous level-condition result that edge detection compares against;
/// `None` means the rule has not produced a usable condition yet.
#[derive(Clone, Debug)]
pub struct RuleEvalState {
    pub revision: u64,
    pub prev: Option<bool>,
    pub last_triggered_ms: Option<u64>,
    pub kind: KindState,
}

impl RuleEvalState {
    pub fn for_rule(rule: &AlertRule) -> Self {
        Self {
            revision: rule.revision,
            prev: None,
            last_triggered_ms: None,
            kind: KindState::for_kind(&rule.kind),
        }
    }
}
