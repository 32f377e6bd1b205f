//! Ledger-tail history aggregation shared by the governance scanners.
//!
//! Attempts are counted from `tuning_applied` entries (actual application
//! events — the `promotion_applied` intent entries are audit-only and would
//! double-count) and rollbacks from `tuning_rolled_back` entries. All maps
//! are BTree-ordered so every consumer iterates deterministically.

use std::collections::BTreeMap;

use crate::ledger::LedgerEntry;

/// Exact-key attempt/rollback tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub attempts: u64,
    pub rollbacks: u64,
}

impl KeyStats {
    /// Rollback rate; zero when nothing was attempted.
    #[must_use]
    pub fn rollback_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.rollbacks as f64 / self.attempts as f64
        }
    }
}

/// Exact key `(module, knob, value_key, baseline_key)`.
pub type ExactKey = (String, String, String, String);

/// Aggregated view of a ledger tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailHistory {
    pub by_key: BTreeMap<ExactKey, KeyStats>,
    /// Global trial counts per baseline bucket.
    pub trials_per_baseline: BTreeMap<String, u64>,
}

impl TailHistory {
    #[must_use]
    pub fn stats(&self, module: &str, knob: &str, value_key: &str, baseline_key: &str) -> KeyStats {
        self.by_key
            .get(&(
                module.to_string(),
                knob.to_string(),
                value_key.to_string(),
                baseline_key.to_string(),
            ))
            .copied()
            .unwrap_or_default()
    }
}

fn payload_str<'a>(entry: &'a LedgerEntry, field: &str) -> Option<&'a str> {
    entry.payload.get(field).and_then(|v| v.as_str())
}

fn payload_knob_map<'a>(
    entry: &'a LedgerEntry,
    field: &str,
) -> impl Iterator<Item = (&'a str, &'a str)> {
    entry
        .payload
        .get(field)
        .and_then(|v| v.as_object())
        .into_iter()
        .flat_map(|map| {
            map.iter()
                .filter_map(|(knob, value)| value.as_str().map(|v| (knob.as_str(), v)))
        })
}

/// Aggregate a ledger tail into exact-key and per-baseline tallies.
#[must_use]
pub fn aggregate(tail: &[LedgerEntry]) -> TailHistory {
    let mut history = TailHistory::default();
    for entry in tail {
        match entry.entry_type.as_str() {
            "tuning_applied" => {
                let Some(module) = payload_str(entry, "module_id") else {
                    continue;
                };
                let Some(baseline) = payload_str(entry, "baseline_key") else {
                    continue;
                };
                let mut counted_trial = false;
                for (knob, value_key) in payload_knob_map(entry, "applied") {
                    history
                        .by_key
                        .entry((
                            module.to_string(),
                            knob.to_string(),
                            value_key.to_string(),
                            baseline.to_string(),
                        ))
                        .or_default()
                        .attempts += 1;
                    counted_trial = true;
                }
                if counted_trial {
                    *history
                        .trials_per_baseline
                        .entry(baseline.to_string())
                        .or_default() += 1;
                }
            }
            "tuning_rolled_back" => {
                let Some(module) = payload_str(entry, "module_id") else {
                    continue;
                };
                let Some(baseline) = payload_str(entry, "baseline_key") else {
                    continue;
                };
                for (knob, value_key) in payload_knob_map(entry, "attempted") {
                    history
                        .by_key
                        .entry((
                            module.to_string(),
                            knob.to_string(),
                            value_key.to_string(),
                            baseline.to_string(),
                        ))
                        .or_default()
                        .rollbacks += 1;
                }
            }
            _ => {}
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(entry_type: &str, payload: serde_json::Value) -> LedgerEntry {
        LedgerEntry {
            idx: 0,
            entry_type: entry_type.to_string(),
            payload,
            provenance: BTreeMap::new(),
            prev_hash: String::new(),
            entry_hash: String::new(),
        }
    }

    #[test]
    fn attempts_and_rollbacks_are_tallied_per_exact_key() {
        let tail = vec![
            entry(
                "tuning_applied",
                json!({
                    "module_id": "cache",
                    "baseline_key": "queue_depth=le_10",
                    "applied": {"workers": "8"},
                }),
            ),
            entry(
                "tuning_applied",
                json!({
                    "module_id": "cache",
                    "baseline_key": "queue_depth=le_10",
                    "applied": {"workers": "8"},
                }),
            ),
            entry(
                "tuning_rolled_back",
                json!({
                    "module_id": "cache",
                    "baseline_key": "queue_depth=le_10",
                    "attempted": {"workers": "8"},
                }),
            ),
        ];
        let history = aggregate(&tail);
        let stats = history.stats("cache", "workers", "8", "queue_depth=le_10");
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.rollback_rate(), 0.5);
        assert_eq!(history.trials_per_baseline["queue_depth=le_10"], 2);
    }

    #[test]
    fn promotion_intent_entries_do_not_double_count() {
        let tail = vec![entry(
            "promotion_applied",
            json!({
                "module_id": "cache",
                "baseline_key": "queue_depth=le_10",
                "applied": {"workers": "8"},
            }),
        )];
        let history = aggregate(&tail);
        assert_eq!(
            history.stats("cache", "workers", "8", "queue_depth=le_10"),
            KeyStats::default()
        );
    }

    #[test]
    fn unknown_keys_read_as_zero() {
        let history = aggregate(&[]);
        let stats = history.stats("m", "k", "1", "none");
        assert_eq!(stats.attempts, 0);
        assert_eq!(stats.rollback_rate(), 0.0);
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        let tail = vec![
            entry("tuning_applied", json!({"module_id": "cache"})),
            entry("tuning_applied", json!({"applied": {"workers": "8"}})),
            entry("tuning_applied", json!("not an object")),
        ];
        let history = aggregate(&tail);
        assert!(history.by_key.is_empty());
    }
}
