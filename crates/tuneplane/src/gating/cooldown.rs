//! Cooldowns: ledger-index-scoped suppression of specific knob values.
//!
//! Entries expire by ledger-index comparison, never wall-clock time —
//! determinism requires this. Cooldowns are set only by the governance
//! cooldown scanner; the optimizer only consults them. Expired entries
//! are pruned lazily on scan.
//!
//! Log codes:
//! - `TP-COOLDOWN-001`: store loaded
//! - `TP-COOLDOWN-002`: store unparsable, degrading to empty

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::baseline::BaselineSignature;
use crate::envelope::KnobValue;
use crate::persist::{atomic_write_json, PersistError};

/// Schema version written into cooldown store files.
pub const COOLDOWN_SCHEMA_VERSION: &str = "tuneplane.cooldown.v1";

/// Exact-key cooldown record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownEntry {
    /// Ledger index at which the cooldown was set.
    pub set_idx: u64,
    /// First ledger index at which the cooldown no longer applies.
    pub until_idx: u64,
    /// Supporting evidence at set time.
    pub attempts: u64,
    pub rollbacks: u64,
}

/// Canonical cooldown key for `(module, knob, value, baseline)`.
#[must_use]
pub fn cooldown_key(
    module: &str,
    knob: &str,
    value: &KnobValue,
    baseline: &BaselineSignature,
) -> String {
    format!(
        "{module}::{knob}::{}::{}",
        value.key_string(),
        baseline.key()
    )
}

/// Wildcard key suppressing every value of a knob in a baseline bucket.
#[must_use]
pub fn cooldown_wildcard_key(module: &str, knob: &str, baseline: &BaselineSignature) -> String {
    format!("{module}::{knob}::*::{}", baseline.key())
}

/// Keyed cooldown entries with ledger-index expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownStore {
    entries: BTreeMap<String, CooldownEntry>,
}

impl CooldownStore {
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
    pub fn get(&self, key: &str) -> Option<&CooldownEntry> {
        self.entries.get(key)
    }

    /// Whether a cooldown is active at the given ledger index.
    #[must_use]
    pub fn is_active(&self, key: &str, now_idx: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| now_idx < entry.until_idx)
    }

    /// Exact-key or knob-wide wildcard cooldown check.
    #[must_use]
    pub fn is_value_cooled(
        &self,
        module: &str,
        knob: &str,
        value: &KnobValue,
        baseline: &BaselineSignature,
        now_idx: u64,
    ) -> bool {
        self.is_active(&cooldown_key(module, knob, value, baseline), now_idx)
            || self.is_active(&cooldown_wildcard_key(module, knob, baseline), now_idx)
    }

    /// Insert or replace an entry. Only the governance scanner calls this.
    pub fn set(&mut self, key: String, entry: CooldownEntry) {
        self.entries.insert(key, entry);
    }

    /// Remove expired entries; returns them (callers log `cooldown_cleared`
    /// per removal, and `.len()` is the pruned count).
    pub fn prune_expired(&mut self, now_idx: u64) -> Vec<(String, CooldownEntry)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now_idx >= entry.until_idx)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Iterate entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CooldownEntry)> {
        self.entries.iter()
    }

    // -- Persistence --------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        atomic_write_json(
            path,
            &CooldownStoreFile {
                schema_version: COOLDOWN_SCHEMA_VERSION.to_string(),
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
                    warn!(code = "TP-COOLDOWN-002", path = %path.display(), error = %source, "cooldown store unreadable, degrading to empty");
                }
                return Self::default();
            }
        };
        match serde_json::from_slice::<CooldownStoreFile>(&bytes) {
            Ok(file) => {
                info!(code = "TP-COOLDOWN-001", entries = file.entries.len(), "cooldown store loaded");
                Self {
                    entries: file.entries,
                }
            }
            Err(e) => {
                warn!(code = "TP-COOLDOWN-002", path = %path.display(), error = %e, "cooldown store unparsable, degrading to empty");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CooldownStoreFile {
    schema_version: String,
    entries: BTreeMap<String, CooldownEntry>,
}
