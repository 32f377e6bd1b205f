//! Cooldown derivation from rollback history.
//!
//! The scanner is the only writer of cooldown entries: when an exact key's
//! rollback rate exceeds the policy threshold, a cooldown is set expiring
//! after `cooldown_cycles` ledger indices and a `cooldown_set` entry is
//! written. Expired entries are pruned and logged as `cooldown_cleared` —
//! decay is expressed as new ledger entries, never as mutation of old ones.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::GovernancePolicy;
use crate::gating::cooldown::{CooldownEntry, CooldownStore};
use crate::governance::history::aggregate;
use crate::ledger::{base_provenance, FileLedger, LedgerEntry, LedgerError};

/// What one scan pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownScanReport {
    /// Keys newly placed on cooldown.
    pub set: Vec<String>,
    /// Keys whose cooldowns expired and were pruned.
    pub cleared: Vec<String>,
}

/// Scan a ledger tail for keys that have earned a cooldown, and prune
/// expired entries. Every change is logged to the ledger.
pub fn scan_cooldowns(
    tail: &[LedgerEntry],
    store: &mut CooldownStore,
    policy: &GovernancePolicy,
    ledger: &mut FileLedger,
) -> Result<CooldownScanReport, LedgerError> {
    let now_idx = ledger.next_idx();
    let mut report = CooldownScanReport::default();

    for (key, entry) in store.prune_expired(now_idx) {
        ledger.append(
            "cooldown_cleared",
            json!({
                "key": key,
                "set_idx": entry.set_idx,
                "until_idx": entry.until_idx,
            }),
            base_provenance("cooldown_scanner"),
        )?;
        report.cleared.push(key);
    }

    let history = aggregate(tail);
    for ((module, knob, value_key, baseline_key), stats) in &history.by_key {
        if stats.attempts == 0 || stats.rollback_rate() <= policy.max_rollback_rate {
            continue;
        }
        let key = format!("{module}::{knob}::{value_key}::{baseline_key}");
        if store.is_active(&key, now_idx) {
            continue;
        }
        let entry = CooldownEntry {
            set_idx: now_idx,
            until_idx: now_idx + policy.cooldown_cycles,
            attempts: stats.attempts,
            rollbacks: stats.rollbacks,
        };
        ledger.append(
            "cooldown_set",
            json!({
                "key": key,
                "set_idx": entry.set_idx,
                "until_idx": entry.until_idx,
                "attempts": entry.attempts,
                "rollbacks": entry.rollbacks,
            }),
            base_provenance("cooldown_scanner"),
        )?;
        store.set(key.clone(), entry);
        report.set.push(key);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn applied() -> LedgerEntry {
        LedgerEntry {
            idx: 0,
            entry_type: "tuning_applied".to_string(),
            payload: json!({
                "module_id": "cache",
                "baseline_key": "queue_depth=le_10",
                "applied": {"workers": "16"},
            }),
            provenance: BTreeMap::new(),
            prev_hash: String::new(),
            entry_hash: String::new(),
        }
    }

    fn rolled_back() -> LedgerEntry {
        LedgerEntry {
            idx: 0,
            entry_type: "tuning_rolled_back".to_string(),
            payload: json!({
                "module_id": "cache",
                "baseline_key": "queue_depth=le_10",
                "attempted": {"workers": "16"},
            }),
            provenance: BTreeMap::new(),
            prev_hash: String::new(),
            entry_hash: String::new(),
        }
    }

    #[test]
    fn excessive_rollbacks_set_a_cooldown() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let mut store = CooldownStore::new();
        let tail = vec![applied(), applied(), rolled_back(), rolled_back()];

        let report = scan_cooldowns(&tail, &mut store, &GovernancePolicy::default(), &mut ledger)
            .expect("scan");
        assert_eq!(report.set.len(), 1);
        let key = &report.set[0];
        assert!(store.is_active(key, ledger.next_idx()));

        let entries = ledger.read_tail(10).expect("tail");
        assert!(entries.iter().any(|e| e.entry_type == "cooldown_set"));
    }

    #[test]
    fn low_rollback_rate_sets_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let mut store = CooldownStore::new();
        let tail = vec![applied(), applied(), applied(), applied(), rolled_back()];

        let report = scan_cooldowns(&tail, &mut store, &GovernancePolicy::default(), &mut ledger)
            .expect("scan");
        assert!(report.set.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn active_cooldown_is_not_reset() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let mut store = CooldownStore::new();
        let tail = vec![applied(), rolled_back()];
        let policy = GovernancePolicy::default();

        let first = scan_cooldowns(&tail, &mut store, &policy, &mut ledger).expect("first");
        assert_eq!(first.set.len(), 1);
        let second = scan_cooldowns(&tail, &mut store, &policy, &mut ledger).expect("second");
        assert!(second.set.is_empty(), "active cooldown must not be re-set");
    }

    #[test]
    fn expiry_is_pruned_and_logged() {
        let dir = TempDir::new().expect("tempdir");
        let mut ledger = FileLedger::open(dir.path()).expect("open");
        let mut store = CooldownStore::new();
        store.set(
            "cache::workers::16::queue_depth=le_10".to_string(),
            CooldownEntry {
                set_idx: 0,
                until_idx: 0,
                attempts: 2,
                rollbacks: 2,
            },
        );

        let report = scan_cooldowns(&[], &mut store, &GovernancePolicy::default(), &mut ledger)
            .expect("scan");
        assert_eq!(report.cleared.len(), 1);
        assert!(store.is_empty());
        let entries = ledger.read_tail(10).expect("tail");
        assert!(entries.iter().any(|e| e.entry_type == "cooldown_cleared"));
    }
}
