//! Statistical promotion proposal scanning.
//!
//! The scanner reads a ledger tail and the effect store and emits, per
//! `(module, knob, baseline)`, the best candidate value that passes the
//! sample-count, effect-size, and z-score gates and is not vetoed by its
//! exact-key rollback rate. Proposals are sorted and independently
//! reproducible from the same inputs; nothing here approves anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canonical::{content_hash, DOMAIN_PROPOSAL};
use crate::config::GovernancePolicy;
use crate::effect_store::EffectStore;
use crate::envelope::{KnobValue, TuningEnvelope};
use crate::governance::history::{aggregate, TailHistory};
use crate::ledger::LedgerEntry;
use crate::optimizer::MetricDirection;

/// One reproducible promotion candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionProposal {
    /// Content hash of this proposal with this field blanked.
    pub proposal_hash: String,
    pub module_id: String,
    pub knob: String,
    pub value: KnobValue,
    pub baseline_key: String,
    pub metric: String,
    pub n: u64,
    pub mean: f64,
    pub z: f64,
    /// Exact-key history supporting the veto decision.
    pub attempts: u64,
    pub rollbacks: u64,
    /// Global trial count observed in this baseline bucket.
    pub baseline_trials: u64,
}

impl PromotionProposal {
    /// Recompute the content hash with `proposal_hash` blanked.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut blanked = self.clone();
        blanked.proposal_hash = String::new();
        content_hash(DOMAIN_PROPOSAL, &blanked)
    }
}

/// Scan ledger + effect-store history for promotion candidates.
#[must_use]
pub fn scan_for_promotions(
    tail: &[LedgerEntry],
    effects: &EffectStore,
    envelopes: &BTreeMap<String, TuningEnvelope>,
    policy: &GovernancePolicy,
    metric: &str,
    direction: MetricDirection,
) -> Vec<PromotionProposal> {
    let history = aggregate(tail);
    let mut proposals = Vec::new();

    for (module, envelope) in envelopes {
        for (knob, spec) in &envelope.knobs {
            // Best passing candidate per baseline bucket.
            let mut best_per_baseline: BTreeMap<String, PromotionProposal> = BTreeMap::new();
            for value in spec.candidates() {
                for (baseline, stats) in effects.buckets_for(module, knob, &value, metric) {
                    if stats.n < policy.min_samples {
                        continue;
                    }
                    if stats.mean.abs() < policy.min_abs_effect {
                        continue;
                    }
                    let z = stats.z_score();
                    if z < policy.z_threshold {
                        continue;
                    }
                    let baseline_key = baseline.key();
                    let key_stats =
                        history.stats(module, knob, &value.key_string(), &baseline_key);
                    if key_stats.attempts > 0
                        && key_stats.rollback_rate() > policy.max_rollback_rate
                    {
                        continue;
                    }
                    let candidate = PromotionProposal {
                        proposal_hash: String::new(),
                        module_id: module.clone(),
                        knob: knob.clone(),
                        value: value.clone(),
                        baseline_key: baseline_key.clone(),
                        metric: metric.to_string(),
                        n: stats.n,
                        mean: stats.mean,
                        z,
                        attempts: key_stats.attempts,
                        rollbacks: key_stats.rollbacks,
                        baseline_trials: baseline_trials(&history, &baseline_key),
                    };
                    let replace = match best_per_baseline.get(&baseline_key) {
                        None => true,
                        // Strict improvement: candidate order is
                        // lexicographic, so ties keep the smaller value.
                        Some(current) => {
                            direction.score(candidate.mean) < direction.score(current.mean)
                        }
                    };
                    if replace {
                        best_per_baseline.insert(baseline_key, candidate);
                    }
                }
            }
            proposals.extend(best_per_baseline.into_values());
        }
    }

    for proposal in &mut proposals {
        proposal.proposal_hash = proposal.compute_hash().unwrap_or_default();
    }
    proposals.sort_by(|a, b| {
        (&a.module_id, &a.knob, &a.baseline_key).cmp(&(&b.module_id, &b.knob, &b.baseline_key))
    });
    proposals
}

fn baseline_trials(history: &TailHistory, baseline_key: &str) -> u64 {
    history
        .trials_per_baseline
        .get(baseline_key)
        .copied()
        .unwrap_or(0)
}
