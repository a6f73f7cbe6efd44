//! Hot-reloadable rule index.
//!
//! Reads happen once per tick per instrument and must never wait on a
//! writer: `active_rules` takes a short read lock and clones an `Arc` of a
//! prebuilt per-symbol snapshot. Writers rebuild the affected snapshot and
//! swap it in, so a read in progress keeps its own consistent copy
//! (copy-on-write swap, no fine-grained locking on the hot path).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RuleConfigError;
use crate::metrics::counters::Counters;
use crate::rules::model::AlertRule;

/// Per-rule health flag surfaced to the external management interface.
#[derive(Clone, Debug)]
pub struct RuleHealth {
    pub rule_id: Uuid,
    pub symbol: String,
    pub name: String,
    pub valid: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
struct StoredRule {
    rule: Arc<AlertRule>,
    invalid: Option<RuleConfigError>,
}

pub struct RuleStore {
    /// All known rules, including inactive and invalid ones.
    rules: RwLock<HashMap<Uuid, StoredRule>>,

    /// Prebuilt evaluation snapshots: active + valid rules per symbol,
    /// ordered by rule id for deterministic evaluation.
    snapshots: RwLock<HashMap<String, Arc<Vec<Arc<AlertRule>>>>>,

    empty: Arc<Vec<Arc<AlertRule>>>,
    counters: Counters,
}

impl RuleStore {
    pub fn new(counters: Counters) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            empty: Arc::new(Vec::new()),
            counters,
        }
    }

    /// Read path: the evaluation snapshot for one instrument.
    pub fn active_rules(&self, symbol: &str) -> Arc<Vec<Arc<AlertRule>>> {
        self.snapshots
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| self.empty.clone())
    }

    /// Write path: insert or replace a rule.
    ///
    /// An invalid configuration is kept (for health reporting) but marked
    /// invalid, excluded from evaluation snapshots and logged exactly once
    /// here, never per tick. Every upsert bumps the rule's revision so the
    /// engine rebuilds its evaluation state from scratch.
    pub fn upsert_rule(&self, mut rule: AlertRule) {
        let invalid = rule.kind.validate().err();

        let mut rules = self.rules.write();
        rule.revision = rules
            .get(&rule.rule_id)
            .map(|s| s.rule.revision + 1)
            .unwrap_or(1);

        if let Some(err) = &invalid {
            self.counters.rules_invalid.fetch_add(1, Relaxed);
            warn!(
                rule_id = %rule.rule_id,
                symbol = %rule.symbol,
                error = %err,
                "rule configuration invalid; rule excluded from evaluation"
            );
        } else {
            info!(
                rule_id = %rule.rule_id,
                symbol = %rule.symbol,
                revision = rule.revision,
                "rule loaded"
            );
        }

        let symbol = rule.symbol.clone();
        rules.insert(
            rule.rule_id,
            StoredRule {
                rule: Arc::new(rule),
                invalid,
            },
        );
        self.rebuild_snapshot(&rules, &symbol);
    }

    /// Excludes a rule from evaluation without deleting it.
    pub fn deactivate_rule(&self, rule_id: &Uuid) -> bool {
        let mut rules = self.rules.write();
        let Some(stored) = rules.get_mut(rule_id) else {
            return false;
        };

        let mut rule = (*stored.rule).clone();
        rule.active = false;
        stored.rule = Arc::new(rule);

        let symbol = stored.rule.symbol.clone();
        debug!(rule_id = %rule_id, symbol = %symbol, "rule deactivated");
        self.rebuild_snapshot(&rules, &symbol);
        true
    }

    pub fn remove_rule(&self, rule_id: &Uuid) -> bool {
        let mut rules = self.rules.write();
        let Some(stored) = rules.remove(rule_id) else {
            return false;
        };

        let symbol = stored.rule.symbol.clone();
        debug!(rule_id = %rule_id, symbol = %symbol, "rule removed");
        self.rebuild_snapshot(&rules, &symbol);
        true
    }

    /// Health flags for every known rule, sorted by rule id.
    pub fn rule_health(&self) -> Vec<RuleHealth> {
        let mut out: Vec<RuleHealth> = self
            .rules
            .read()
            .values()
            .map(|s| RuleHealth {
                rule_id: s.rule.rule_id,
                symbol: s.rule.symbol.clone(),
                name: s.rule.name.clone(),
                valid: s.invalid.is_none(),
                reason: s.invalid.as_ref().map(|e| e.to_string()),
            })
            .collect();
        out.sort_by_key(|h| h.rule_id);
        out
    }

    fn rebuild_snapshot(&self, rules: &HashMap<Uuid, StoredRule>, symbol: &str) {
        let mut list: Vec<Arc<AlertRule>> = rules
            .values()
            .filter(|s| s.rule.symbol == symbol && s.rule.active && s.invalid.is_none())
            .map(|s| s.rule.clone())
            .collect();
        list.sort_by_key(|r| r.rule_id);

        self.snapshots
            .write()
            .insert(symbol.to_string(), Arc::new(list));
    }
}
