//! Safe sets: baseline-scoped, decaying domains of low-risk knob values.
//!
//! Derived from attempt/rollback history in the ledger tail: a value with
//! enough attempts and a low enough rollback rate is considered safe for
//! its `(module, knob, baseline)` scope. Numeric domains collapse to a
//! `[min, max]` range; non-numeric domains stay enumerated. Entries decay
//! by ledger index and are consulted — not required — by the optimizer and
//! the experiment path.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::baseline::BaselineSignature;
use crate::config::GovernancePolicy;
use crate::effect_store::EffectStore;
use crate::envelope::{KnobValue, TuningEnvelope};
use crate::governance::history::aggregate;
use crate::ledger::LedgerEntry;
use crate::persist::{atomic_write_json, PersistError};

/// Schema version written into safe-set store files.
pub const SAFE_SET_SCHEMA_VERSION: &str = "tuneplane.safe-set.v1";

/// The shape of a safe domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafeDomain {
    /// Numeric values collapsed to an inclusive range.
    Range { min: f64, max: f64 },
    /// Explicit enumerated value keys.
    Values { values: BTreeSet<String> },
}

impl SafeDomain {
    #[must_use]
    pub fn contains(&self, value: &KnobValue) -> bool {
        match self {
            Self::Range { min, max } => value
                .as_f64()
                .is_some_and(|v| v >= *min && v <= *max),
            Self::Values { values } => values.contains(&value.key_string()),
        }
    }
}

/// One derived safe set with its evidence and expiry window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeSetEntry {
    pub domain: SafeDomain,
    /// Ledger index at which the set was derived.
    pub set_idx: u64,
    /// First ledger index at which the set no longer applies.
    pub until_idx: u64,
    /// Total attempts across the values that qualified.
    pub attempts: u64,
    /// Total rollbacks across the values that qualified.
    pub rollbacks: u64,
}

/// Canonical safe-set key for `(module, knob, baseline)`.
#[must_use]
pub fn safe_set_key(module: &str, knob: &str, baseline_key: &str) -> String {
    format!("{module}::{knob}::{baseline_key}")
}

/// Keyed safe-set entries with ledger-index decay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeSetStore {
    entries: BTreeMap<String, SafeSetEntry>,
}

impl SafeSetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SafeSetEntry> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: String, entry: SafeSetEntry) {
        self.entries.insert(key, entry);
    }

    /// Consult the safe set for a value. `None` means no active entry —
    /// no restriction. `Some(membership)` reports the verdict.
    #[must_use]
    pub fn permits(
        &self,
        module: &str,
        knob: &str,
        baseline_key: &str,
        value: &KnobValue,
        now_idx: u64,
    ) -> Option<bool> {
        let entry = self.entries.get(&safe_set_key(module, knob, baseline_key))?;
        if now_idx >= entry.until_idx {
            return None;
        }
        Some(entry.domain.contains(value))
    }

    /// Remove decayed entries; returns the removed keys.
    pub fn prune_expired(&mut self, now_idx: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now_idx >= entry.until_idx)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    // -- Persistence --------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        atomic_write_json(
            path,
            &SafeSetFile {
                schema_version: SAFE_SET_SCHEMA_VERSION.to_string(),
                entries: self.entries.clone(),
            },
        )
    }

    /// Load a store file; missing or unparsable files load as empty.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(source) => {
                if source.kind() != std::io::ErrorKind::NotFound {
                    warn!(code = "TP-SAFESET-002", path = %path.display(), error = %source, "safe-set store unreadable, degrading to empty");
                }
                return Self::default();
            }
        };
        match serde_json::from_slice::<SafeSetFile>(&bytes) {
            Ok(file) => {
                info!(code = "TP-SAFESET-001", entries = file.entries.len(), "safe-set store loaded");
                Self {
                    entries: file.entries,
                }
            }
            Err(e) => {
                warn!(code = "TP-SAFESET-002", path = %path.display(), error = %e, "safe-set store unparsable, degrading to empty");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SafeSetFile {
    schema_version: String,
    entries: BTreeMap<String, SafeSetEntry>,
}

/// Derive safe sets from a ledger tail.
///
/// A value qualifies when its exact-key attempts reach `min_attempts` with
/// a rollback rate at or below `safe_max_rollback_rate`, and — when a
/// guardrail metric is configured — its same-bucket mean on that metric is
/// not harmful (positive, lower-is-better). Absent guardrail stats never
/// veto.
#[must_use]
pub fn build_safe_sets(
    tail: &[LedgerEntry],
    effects: &EffectStore,
    envelopes: &BTreeMap<String, TuningEnvelope>,
    policy: &GovernancePolicy,
    now_idx: u64,
) -> SafeSetStore {
    let history = aggregate(tail);
    // Regroup exact keys by (module, knob, baseline).
    let mut grouped: BTreeMap<(String, String, String), Vec<(String, u64, u64)>> = BTreeMap::new();
    for ((module, knob, value_key, baseline_key), stats) in &history.by_key {
        grouped
            .entry((module.clone(), knob.clone(), baseline_key.clone()))
            .or_default()
            .push((value_key.clone(), stats.attempts, stats.rollbacks));
    }

    let mut store = SafeSetStore::new();
    for ((module, knob, baseline_key), values) in grouped {
        let envelope = envelopes.get(&module);
        let baseline = BaselineSignature::from_key(&baseline_key);
        let mut safe_values: Vec<KnobValue> = Vec::new();
        let mut attempts_total = 0u64;
        let mut rollbacks_total = 0u64;
        for (value_key, attempts, rollbacks) in values {
            if attempts < policy.min_attempts {
                continue;
            }
            let rate = rollbacks as f64 / attempts as f64;
            if rate > policy.safe_max_rollback_rate {
                continue;
            }
            let Some(value) = resolve_value(envelope, &knob, &value_key) else {
                continue;
            };
            if let Some(guardrail) = &policy.guardrail_metric {
                let harmful = effects
                    .get_effect_stats(&module, &knob, &value, &baseline, guardrail)
                    .is_some_and(|stats| stats.mean > 0.0);
                if harmful {
                    continue;
                }
            }
            attempts_total += attempts;
            rollbacks_total += rollbacks;
            safe_values.push(value);
        }
        if safe_values.is_empty() {
            continue;
        }
        let domain = collapse_domain(&safe_values);
        store.set(
            safe_set_key(&module, &knob, &baseline_key),
            SafeSetEntry {
                domain,
                set_idx: now_idx,
                until_idx: now_idx + policy.safe_set_decay_cycles,
                attempts: attempts_total,
                rollbacks: rollbacks_total,
            },
        );
    }
    store
}

/// Map a value key back to a typed value through the envelope's candidate
/// enumeration.
fn resolve_value(
    envelope: Option<&TuningEnvelope>,
    knob: &str,
    value_key: &str,
) -> Option<KnobValue> {
    let spec = envelope?.knob(knob)?;
    spec.candidates()
        .into_iter()
        .find(|candidate| candidate.key_string() == value_key)
}

/// Numeric domains collapse to `[min, max]`; anything else stays explicit.
fn collapse_domain(values: &[KnobValue]) -> SafeDomain {
    let numerics: Vec<f64> = values.iter().filter_map(KnobValue::as_f64).collect();
    if numerics.len() == values.len() && !numerics.is_empty() {
        let min = numerics.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numerics.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        SafeDomain::Range { min, max }
    } else {
        SafeDomain::Values {
            values: values.iter().map(KnobValue::key_string).collect(),
        }
    }
}
