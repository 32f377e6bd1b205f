//! Budget-constrained portfolio optimizer.
//!
//! Given an envelope's knob specs, the effect store, a baseline signature,
//! and a target metric, the optimizer deterministically selects which knobs
//! to change this cycle. Traversal is by sorted knob name; ties break by
//! lexicographic value string; identical inputs always produce identical
//! output. Every knob of the envelope ends up in exactly one of
//! `applied` / `excluded` / `shadow_only` — never silently dropped.
//!
//! Cross-bucket inference (when enabled) generalizes evidence from similar
//! baseline buckets, but its estimates are recorded as shadow suggestions
//! only: cross-bucket generalization is unproven, so it is never applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::baseline::BaselineSignature;
use crate::config::ShadowPolicy;
use crate::effect_store::EffectStore;
use crate::envelope::{KnobValue, TuningEnvelope};
use crate::gating::cooldown::CooldownStore;
use crate::governance::overlay::PromotionOverlay;
use crate::governance::safe_set::SafeSetStore;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Whether smaller or larger metric deltas are improvements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    LowerIsBetter,
    HigherIsBetter,
}

impl MetricDirection {
    /// Normalize a mean delta so that lower scores are always better.
    #[must_use]
    pub fn score(self, mean: f64) -> f64 {
        match self {
            Self::LowerIsBetter => mean,
            Self::HigherIsBetter => -mean,
        }
    }

    /// Sign of a harmful delta on this metric.
    #[must_use]
    pub fn harmful_sign(self) -> f64 {
        match self {
            Self::LowerIsBetter => 1.0,
            Self::HigherIsBetter => -1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome artifacts
// ---------------------------------------------------------------------------

/// Where a shadow suggestion's estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowOrigin {
    SameBucket,
    CrossBucket,
}

/// A suggestion that is recorded but not applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowSuggestion {
    pub value: KnobValue,
    pub estimated_mean: f64,
    pub origin: ShadowOrigin,
}

/// One donor bucket used by cross-bucket inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorStat {
    pub baseline_key: String,
    pub similarity: f64,
    pub mean: f64,
    pub n: u64,
    pub z: f64,
}

/// Detail of a cross-bucket estimate, kept alongside the shadow suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossBucketEstimate {
    pub value: KnobValue,
    pub donors: Vec<DonorStat>,
    pub weighted_mean: f64,
    pub damped_mean: f64,
}

/// Accounting for knobs not applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioNotes {
    /// Knob -> machine-readable exclusion reason.
    pub excluded: BTreeMap<String, String>,
    /// Knob -> suggestion recorded without application.
    pub shadow_only: BTreeMap<String, ShadowSuggestion>,
    /// Knob -> cross-bucket inference detail.
    pub shadow_cross_bucket: BTreeMap<String, CrossBucketEstimate>,
}

/// Deterministic optimizer output for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioOutcome {
    pub module_id: String,
    pub baseline_key: String,
    pub metric: String,
    pub applied: BTreeMap<String, KnobValue>,
    pub notes: PortfolioNotes,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Read-only stores consulted during selection.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerContext<'a> {
    pub effect_store: &'a EffectStore,
    pub cooldowns: &'a CooldownStore,
    pub safe_sets: Option<&'a SafeSetStore>,
    pub overlay: Option<&'a PromotionOverlay>,
    /// Ledger clock for cooldown and safe-set expiry.
    pub now_idx: u64,
}

/// One optimizer invocation.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerRequest<'a> {
    pub envelope: &'a TuningEnvelope,
    pub baseline: &'a BaselineSignature,
    pub metric: &'a str,
    pub direction: MetricDirection,
    pub shadow: &'a ShadowPolicy,
    /// Emit every selection as a shadow suggestion instead of applying.
    pub shadow_only: bool,
    /// Shared change budget; applied knobs beyond it are excluded.
    pub max_changes: u32,
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Run the portfolio optimizer for one module.
#[must_use]
pub fn run_portfolio(request: &OptimizerRequest<'_>, ctx: &OptimizerContext<'_>) -> PortfolioOutcome {
    let module = &request.envelope.module_id;
    let mut applied = BTreeMap::new();
    let mut notes = PortfolioNotes::default();
    let mut budget_remaining = request.max_changes;

    // Sorted knob traversal comes free with the envelope's BTreeMap.
    for (knob, spec) in &request.envelope.knobs {
        let candidates = spec.candidates();
        if candidates.len() < 2 {
            notes
                .excluded
                .insert(knob.clone(), "no_candidates".to_string());
            continue;
        }

        // Same-bucket evidence, in candidate (lexicographic) order.
        let scored: Vec<(KnobValue, f64)> = candidates
            .iter()
            .filter_map(|value| {
                ctx.effect_store
                    .get_effect_stats(module, knob, value, request.baseline, request.metric)
                    .map(|stats| (value.clone(), stats.mean))
            })
            .collect();

        if !scored.is_empty() {
            let mut any_cooled = false;
            let mut any_outside_safe_set = false;
            let available: Vec<(KnobValue, f64)> = scored
                .into_iter()
                .filter(|(value, _)| {
                    if ctx.cooldowns.is_value_cooled(
                        module,
                        knob,
                        value,
                        request.baseline,
                        ctx.now_idx,
                    ) {
                        any_cooled = true;
                        return false;
                    }
                    if let Some(safe_sets) = ctx.safe_sets {
                        if safe_sets.permits(
                            module,
                            knob,
                            &request.baseline.key(),
                            value,
                            ctx.now_idx,
                        ) == Some(false)
                        {
                            any_outside_safe_set = true;
                            return false;
                        }
                    }
                    true
                })
                .collect();

            if available.is_empty() {
                let reason = if any_cooled {
                    "cooled_down"
                } else if any_outside_safe_set {
                    "outside_safe_set"
                } else {
                    "no_stats"
                };
                notes.excluded.insert(knob.clone(), reason.to_string());
                continue;
            }

            let preferred = ctx
                .overlay
                .and_then(|overlay| overlay.preferred(module, knob, &request.baseline.key()));
            let bias = ctx.overlay.map_or(0.0, PromotionOverlay::bias);

            // Strict improvement keeps the lexicographically smallest value
            // on ties; the promotion bias is a bounded additive nudge, not
            // a hard override.
            let adjusted_score = |value: &KnobValue, mean: f64| {
                let mut adjusted = request.direction.score(mean);
                if preferred == Some(value) {
                    adjusted -= bias;
                }
                adjusted
            };
            let mut best_adjusted = adjusted_score(&available[0].0, available[0].1);
            let (mut winner, mut winner_mean) = available[0].clone();
            for (value, mean) in &available[1..] {
                let adjusted = adjusted_score(value, *mean);
                if adjusted < best_adjusted {
                    best_adjusted = adjusted;
                    winner = value.clone();
                    winner_mean = *mean;
                }
            }

            if request.shadow_only {
                notes.shadow_only.insert(
                    knob.clone(),
                    ShadowSuggestion {
                        value: winner,
                        estimated_mean: winner_mean,
                        origin: ShadowOrigin::SameBucket,
                    },
                );
            } else if budget_remaining == 0 {
                notes
                    .excluded
                    .insert(knob.clone(), "budget_exhausted".to_string());
            } else {
                applied.insert(knob.clone(), winner);
                budget_remaining -= 1;
            }
            continue;
        }

        // No same-bucket evidence.
        if !request.shadow.enable_cross_bucket_shadow {
            notes.excluded.insert(knob.clone(), "no_stats".to_string());
            continue;
        }

        let mut best_estimate: Option<CrossBucketEstimate> = None;
        for value in &candidates {
            let donors: Vec<DonorStat> = ctx
                .effect_store
                .buckets_for(module, knob, value, request.metric)
                .into_iter()
                .filter(|(donor_baseline, _)| donor_baseline != request.baseline)
                .filter_map(|(donor_baseline, stats)| {
                    let similarity = request.baseline.similarity(&donor_baseline);
                    let z = stats.z_score();
                    if similarity >= request.shadow.min_similarity
                        && z >= request.shadow.z_threshold_shadow
                    {
                        Some(DonorStat {
                            baseline_key: donor_baseline.key(),
                            similarity,
                            mean: stats.mean,
                            n: stats.n,
                            z,
                        })
                    } else {
                        None
                    }
                })
                .collect();
            if donors.is_empty() {
                continue;
            }
            let weight_sum: f64 = donors.iter().map(|d| d.similarity).sum();
            let weighted_mean: f64 =
                donors.iter().map(|d| d.similarity * d.mean).sum::<f64>() / weight_sum;
            let damped_mean = weighted_mean * request.shadow.shadow_penalty;
            let replace = match &best_estimate {
                None => true,
                Some(current) => {
                    request.direction.score(damped_mean)
                        < request.direction.score(current.damped_mean)
                }
            };
            if replace {
                best_estimate = Some(CrossBucketEstimate {
                    value: value.clone(),
                    donors,
                    weighted_mean,
                    damped_mean,
                });
            }
        }

        match best_estimate {
            Some(estimate) => {
                notes.shadow_only.insert(
                    knob.clone(),
                    ShadowSuggestion {
                        value: estimate.value.clone(),
                        estimated_mean: estimate.damped_mean,
                        origin: ShadowOrigin::CrossBucket,
                    },
                );
                notes.shadow_cross_bucket.insert(knob.clone(), estimate);
            }
            None => {
                notes.excluded.insert(knob.clone(), "no_stats".to_string());
            }
        }
    }

    PortfolioOutcome {
        module_id: module.clone(),
        baseline_key: request.baseline.key(),
        metric: request.metric.to_string(),
        applied,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{compute_baseline_signature, numeric_snapshot};
    use crate::envelope::{KnobKind, KnobSpec};
    use crate::gating::cooldown::{cooldown_key, CooldownEntry};

    fn envelope() -> TuningEnvelope {
        TuningEnvelope::new("cache")
            .with_knob(KnobSpec {
                name: "workers".to_string(),
                kind: KnobKind::Int,
                min: Some(1.0),
                max: Some(16.0),
                domain: Vec::new(),
                default: KnobValue::Int(4),
                hot_apply: true,
                required_capability: None,
                stabilization_cycles: 0,
            })
            .with_knob(KnobSpec {
                name: "eviction".to_string(),
                kind: KnobKind::Enum,
                min: None,
                max: None,
                domain: vec!["lru".to_string(), "fifo".to_string()],
                default: KnobValue::Enum("lru".to_string()),
                hot_apply: true,
                required_capability: None,
                stabilization_cycles: 0,
            })
    }

    fn light() -> BaselineSignature {
        compute_baseline_signature(&numeric_snapshot(&[("queue_depth", 5.0)]))
    }

    fn request<'a>(
        envelope: &'a TuningEnvelope,
        baseline: &'a BaselineSignature,
        shadow: &'a ShadowPolicy,
    ) -> OptimizerRequest<'a> {
        OptimizerRequest {
            envelope,
            baseline,
            metric: "latency_ms",
            direction: MetricDirection::LowerIsBetter,
            shadow,
            shadow_only: false,
            max_changes: 10,
        }
    }

    fn context<'a>(
        effect_store: &'a EffectStore,
        cooldowns: &'a CooldownStore,
    ) -> OptimizerContext<'a> {
        OptimizerContext {
            effect_store,
            cooldowns,
            safe_sets: None,
            overlay: None,
            now_idx: 100,
        }
    }

    fn seed(store: &mut EffectStore, value: KnobValue, mean: f64, samples: u64) {
        for _ in 0..samples {
            store.record_sample("cache", "workers", &value, &light(), "latency_ms", mean);
        }
    }

    #[test]
    fn picks_best_mean_for_direction() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        seed(&mut store, KnobValue::Int(1), 4.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        assert_eq!(outcome.applied["workers"], KnobValue::Int(16));
        // eviction has no stats and cross-bucket is off.
        assert_eq!(outcome.notes.excluded["eviction"], "no_stats");
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -5.0, 3);
        seed(&mut store, KnobValue::Int(1), -5.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        // "1" < "16" lexicographically.
        assert_eq!(outcome.applied["workers"], KnobValue::Int(1));
    }

    #[test]
    fn cooled_down_winner_is_skipped() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        seed(&mut store, KnobValue::Int(1), -2.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let mut cooldowns = CooldownStore::new();
        cooldowns.set(
            cooldown_key("cache", "workers", &KnobValue::Int(16), &baseline),
            CooldownEntry {
                set_idx: 90,
                until_idx: 140,
                attempts: 4,
                rollbacks: 3,
            },
        );
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        // The would-be winner is cooled; the runner-up applies.
        assert_eq!(outcome.applied["workers"], KnobValue::Int(1));
    }

    #[test]
    fn all_candidates_cooled_excludes_knob() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let mut cooldowns = CooldownStore::new();
        cooldowns.set(
            cooldown_key("cache", "workers", &KnobValue::Int(16), &baseline),
            CooldownEntry {
                set_idx: 90,
                until_idx: 140,
                attempts: 4,
                rollbacks: 3,
            },
        );
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        assert_eq!(outcome.notes.excluded["workers"], "cooled_down");
        assert!(!outcome.applied.contains_key("workers"));
    }

    #[test]
    fn single_candidate_knob_is_excluded() {
        let envelope = TuningEnvelope::new("cache").with_knob(KnobSpec {
            name: "scale".to_string(),
            kind: KnobKind::Float,
            min: None,
            max: None,
            domain: Vec::new(),
            default: KnobValue::Float(1.0),
            hot_apply: true,
            required_capability: None,
            stabilization_cycles: 0,
        });
        let store = EffectStore::new();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        assert_eq!(outcome.notes.excluded["scale"], "no_candidates");
    }

    #[test]
    fn budget_exhaustion_excludes_later_knobs() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        store.record_sample(
            "cache",
            "eviction",
            &KnobValue::Enum("fifo".to_string()),
            &light(),
            "latency_ms",
            -3.0,
        );
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let mut req = request(&envelope, &baseline, &shadow);
        req.max_changes = 1;
        let outcome = run_portfolio(&req, &context(&store, &cooldowns));
        // Sorted knob order: "eviction" before "workers".
        assert_eq!(
            outcome.applied["eviction"],
            KnobValue::Enum("fifo".to_string())
        );
        assert_eq!(outcome.notes.excluded["workers"], "budget_exhausted");
    }

    #[test]
    fn shadow_only_mode_never_applies() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let mut req = request(&envelope, &baseline, &shadow);
        req.shadow_only = true;
        let outcome = run_portfolio(&req, &context(&store, &cooldowns));
        assert!(outcome.applied.is_empty());
        let suggestion = &outcome.notes.shadow_only["workers"];
        assert_eq!(suggestion.value, KnobValue::Int(16));
        assert_eq!(suggestion.origin, ShadowOrigin::SameBucket);
    }

    #[test]
    fn cross_bucket_inference_is_shadow_only() {
        let mut store = EffectStore::new();
        // Donor bucket: adjacent queue_depth (le_50 vs le_10 scores 0.5),
        // exact input_size; average similarity 0.75 meets the gate.
        let donor = compute_baseline_signature(&numeric_snapshot(&[
            ("queue_depth", 30.0),
            ("input_size", 100.0),
        ]));
        let here = compute_baseline_signature(&numeric_snapshot(&[
            ("queue_depth", 5.0),
            ("input_size", 100.0),
        ]));
        for _ in 0..5 {
            store.record_sample("cache", "workers", &KnobValue::Int(16), &donor, "latency_ms", -8.0);
        }
        let envelope = envelope();
        let shadow = ShadowPolicy {
            enable_cross_bucket_shadow: true,
            ..ShadowPolicy::default()
        };
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &here, &shadow),
            &context(&store, &cooldowns),
        );
        assert!(outcome.applied.is_empty());
        let suggestion = &outcome.notes.shadow_only["workers"];
        assert_eq!(suggestion.origin, ShadowOrigin::CrossBucket);
        // Damped: -8.0 * 0.5.
        assert!((suggestion.estimated_mean - -4.0).abs() < 1e-12);
        let estimate = &outcome.notes.shadow_cross_bucket["workers"];
        assert_eq!(estimate.donors.len(), 1);
        assert_eq!(estimate.donors[0].similarity, 0.75);
    }

    #[test]
    fn dissimilar_donors_are_rejected() {
        let mut store = EffectStore::new();
        // gt_50 vs le_10: similarity 0.0, below the gate.
        let donor = compute_baseline_signature(&numeric_snapshot(&[("queue_depth", 80.0)]));
        for _ in 0..5 {
            store.record_sample("cache", "workers", &KnobValue::Int(16), &donor, "latency_ms", -8.0);
        }
        let envelope = envelope();
        let shadow = ShadowPolicy {
            enable_cross_bucket_shadow: true,
            ..ShadowPolicy::default()
        };
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        assert_eq!(outcome.notes.excluded["workers"], "no_stats");
    }

    #[test]
    fn every_knob_lands_in_exactly_one_bucket() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let outcome = run_portfolio(
            &request(&envelope, &baseline, &shadow),
            &context(&store, &cooldowns),
        );
        for knob in envelope.knobs.keys() {
            let placements = usize::from(outcome.applied.contains_key(knob))
                + usize::from(outcome.notes.excluded.contains_key(knob))
                + usize::from(outcome.notes.shadow_only.contains_key(knob));
            assert_eq!(placements, 1, "knob {knob} placed {placements} times");
        }
    }

    #[test]
    fn identical_inputs_yield_byte_identical_output() {
        let mut store = EffectStore::new();
        seed(&mut store, KnobValue::Int(16), -12.0, 3);
        seed(&mut store, KnobValue::Int(1), -5.0, 2);
        let envelope = envelope();
        let shadow = ShadowPolicy::default();
        let baseline = light();
        let cooldowns = CooldownStore::new();
        let run = || {
            serde_json::to_string(&run_portfolio(
                &request(&envelope, &baseline, &shadow),
                &context(&store, &cooldowns),
            ))
            .expect("serialize")
        };
        assert_eq!(run(), run());
    }
}
