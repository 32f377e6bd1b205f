//! Promotion overlay: the read path from standing promotions back into
//! per-cycle decisions.
//!
//! Active (non-revoked) promotions merge into a baseline-scoped preference
//! map used to (a) bias optimizer tie-breaks toward promoted values via a
//! bounded additive score and (b) fill in missing knob assignments with
//! the promoted default. Both operations are shadow-transparent: an
//! explicit existing assignment is never overridden.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::KnobValue;
use crate::governance::policy_store::{PromotionPolicyItem, PromotionPolicyStore};

/// Baseline-scoped preference map over active promotions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionOverlay {
    /// `module::knob::baseline` -> promoted value.
    prefs: BTreeMap<String, KnobValue>,
    bias: f64,
}

fn pref_key(module: &str, knob: &str, baseline_key: &str) -> String {
    format!("{module}::{knob}::{baseline_key}")
}

impl PromotionOverlay {
    /// Build the overlay from active policy items.
    #[must_use]
    pub fn from_store(store: &PromotionPolicyStore, bias: f64) -> Self {
        let mut prefs = BTreeMap::new();
        for item in store.active_items() {
            prefs.insert(
                pref_key(&item.module_id, &item.knob, &item.baseline_key),
                item.value.clone(),
            );
        }
        Self { prefs, bias }
    }

    /// The bounded additive tie-break score.
    #[must_use]
    pub fn bias(&self) -> f64 {
        self.bias
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefs.is_empty()
    }

    /// The promoted value for a scope, if one stands.
    #[must_use]
    pub fn preferred(&self, module: &str, knob: &str, baseline_key: &str) -> Option<&KnobValue> {
        self.prefs.get(&pref_key(module, knob, baseline_key))
    }

    /// Insert promoted defaults for knobs absent from `assignments`.
    /// Explicit assignments are never overridden. Returns the knobs filled.
    pub fn fill_missing(
        &self,
        module: &str,
        baseline_key: &str,
        assignments: &mut BTreeMap<String, KnobValue>,
    ) -> Vec<String> {
        let prefix = format!("{module}::");
        let suffix = format!("::{baseline_key}");
        let mut filled = Vec::new();
        for (key, value) in &self.prefs {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some(knob) = rest.strip_suffix(&suffix) else {
                continue;
            };
            if knob.contains("::") || assignments.contains_key(knob) {
                continue;
            }
            assignments.insert(knob.to_string(), value.clone());
            filled.push(knob.to_string());
        }
        filled
    }
}

/// Read-only summary of the policy store, per module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernanceReport {
    pub active: Vec<PromotionPolicyItem>,
    pub revoked: Vec<PromotionPolicyItem>,
}

impl GovernanceReport {
    /// Summarize a policy store.
    #[must_use]
    pub fn from_store(store: &PromotionPolicyStore) -> Self {
        let mut report = Self::default();
        for item in store.items() {
            if item.is_active() {
                report.active.push(item.clone());
            } else {
                report.revoked.push(item.clone());
            }
        }
        report
    }
}
