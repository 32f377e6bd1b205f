//! Promotion policy store: the flat list of standing promotions.
//!
//! Items are upserted by the executor and revoked — never deleted — on a
//! failed canary, preserving audit history. Corrupt or unreadable files
//! degrade to an empty policy rather than raising.
//!
//! Log codes:
//! - `TP-POLICY-001`: store loaded
//! - `TP-POLICY-002`: store unparsable, degrading to empty

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::envelope::KnobValue;
use crate::persist::{atomic_write_json, PersistError};

/// Schema version written into policy files.
pub const POLICY_SCHEMA_VERSION: &str = "tuneplane.promotion-policy.v1";

/// One standing (or revoked) promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionPolicyItem {
    pub module_id: String,
    pub knob: String,
    pub value: KnobValue,
    pub baseline_key: String,
    pub metric: String,
    pub promoted_at_idx: u64,
    pub proposal_hash: String,
    /// Set, never cleared, when a promotion canary later fails.
    #[serde(default)]
    pub revoked_at_idx: Option<u64>,
}

impl PromotionPolicyItem {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at_idx.is_none()
    }
}

/// Flat list of promotion items with load/save and upsert/revoke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionPolicyStore {
    items: Vec<PromotionPolicyItem>,
}

impl PromotionPolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn items(&self) -> &[PromotionPolicyItem] {
        &self.items
    }

    /// Active (non-revoked) items, in stored order.
    pub fn active_items(&self) -> impl Iterator<Item = &PromotionPolicyItem> {
        self.items.iter().filter(|item| item.is_active())
    }

    /// Insert or replace the item for `(module, knob, baseline)`.
    pub fn upsert(&mut self, item: PromotionPolicyItem) {
        match self.items.iter_mut().find(|existing| {
            existing.module_id == item.module_id
                && existing.knob == item.knob
                && existing.baseline_key == item.baseline_key
        }) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    /// Mark every active matching item revoked at `idx`. Returns how many
    /// items were revoked.
    pub fn revoke(&mut self, module: &str, knob: &str, baseline_key: &str, idx: u64) -> usize {
        let mut revoked = 0;
        for item in &mut self.items {
            if item.module_id == module
                && item.knob == knob
                && item.baseline_key == baseline_key
                && item.is_active()
            {
                item.revoked_at_idx = Some(idx);
                revoked += 1;
            }
        }
        revoked
    }

    // -- Persistence --------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        atomic_write_json(
            path,
            &PolicyFile {
                schema_version: POLICY_SCHEMA_VERSION.to_string(),
                items: self.items.clone(),
            },
        )
    }

    /// Load a policy file; missing or unparsable files load as empty.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(source) => {
                if source.kind() != std::io::ErrorKind::NotFound {
                    warn!(code = "TP-POLICY-002", path = %path.display(), error = %source, "policy store unreadable, degrading to empty");
                }
                return Self::default();
            }
        };
        match serde_json::from_slice::<PolicyFile>(&bytes) {
            Ok(file) => {
                info!(code = "TP-POLICY-001", items = file.items.len(), "policy store loaded");
                Self { items: file.items }
            }
            Err(e) => {
                warn!(code = "TP-POLICY-002", path = %path.display(), error = %e, "policy store unparsable, degrading to empty");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PolicyFile {
    schema_version: String,
    items: Vec<PromotionPolicyItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(value: i64) -> PromotionPolicyItem {
        PromotionPolicyItem {
            module_id: "cache".to_string(),
            knob: "workers".to_string(),
            value: KnobValue::Int(value),
            baseline_key: "queue_depth=le_10".to_string(),
            metric: "latency_ms".to_string(),
            promoted_at_idx: 10,
            proposal_hash: "hash".to_string(),
            revoked_at_idx: None,
        }
    }

    #[test]
    fn upsert_replaces_same_key() {
        let mut store = PromotionPolicyStore::new();
        store.upsert(item(8));
        store.upsert(item(16));
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.items()[0].value, KnobValue::Int(16));
    }

    #[test]
    fn revoke_marks_but_never_deletes() {
        let mut store = PromotionPolicyStore::new();
        store.upsert(item(8));
        let revoked = store.revoke("cache", "workers", "queue_depth=le_10", 42);
        assert_eq!(revoked, 1);
        assert_eq!(store.items().len(), 1);
        assert_eq!(store.items()[0].revoked_at_idx, Some(42));
        assert_eq!(store.active_items().count(), 0);
    }

    #[test]
    fn revoke_is_idempotent_on_already_revoked() {
        let mut store = PromotionPolicyStore::new();
        store.upsert(item(8));
        store.revoke("cache", "workers", "queue_depth=le_10", 42);
        let second = store.revoke("cache", "workers", "queue_depth=le_10", 99);
        assert_eq!(second, 0);
        assert_eq!(store.items()[0].revoked_at_idx, Some(42));
    }

    #[test]
    fn store_roundtrips() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("policy.json");
        let mut store = PromotionPolicyStore::new();
        store.upsert(item(8));
        store.save(&path).expect("save");
        assert_eq!(PromotionPolicyStore::load(&path), store);
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("policy.json");
        fs::write(&path, b"{{{{").expect("write corrupt");
        assert!(PromotionPolicyStore::load(&path).items().is_empty());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().expect("tempdir");
        assert!(PromotionPolicyStore::load(&dir.path().join("missing.json"))
            .items()
            .is_empty());
    }
}
