use thiserror::Error;

/// Ingestion-boundary failures.
///
/// All of these are recovered locally by dropping the payload and bumping a
/// counter; they are never propagated as task failures.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("malformed tick payload: {0}")]
    MalformedInput(String),

    #[error("stale tick for {symbol}: ts {ts_ms} <= watermark {watermark_ms}")]
    StaleTick {
        symbol: String,
        ts_ms: u64,
        watermark_ms: u64,
    },

    #[error("instrument {0} is not tracked")]
    UntrackedInstrument(String),

    #[error("instrument {0} is inactive")]
    InactiveInstrument(String),
}

/// Rule-configuration failures detected when a rule is loaded.
///
/// The rule is kept for health reporting but marked invalid and excluded
/// from evaluation snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleConfigError {
    #[error("threshold must be finite")]
    NonFiniteThreshold,

    #[error("rolling window period must be at least 2")]
    PeriodTooShort,

    #[error("rate-of-change window must be positive")]
    EmptyWindow,

    #[error("volume-spike multiplier must be positive and finite")]
    InvalidMultiplier,

    #[error("combined rule has no sub-conditions")]
    EmptyCombination,

    #[error("combined rules cannot nest further combined rules")]
    NestedCombination,
}

/// Unexpected mid-computation failures for a single rule.
///
/// Isolated by the evaluation worker: logged with rule context, recorded as
/// an error outcome, siblings and subsequent ticks continue unaffected.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("evaluation state does not match rule kind")]
    StateMismatch,

    #[error("non-finite value in {0} computation")]
    NonFinite(&'static str),
}
