//! Tuning plane router: the per-cycle orchestrator.
//!
//! Each cycle computes the baseline signature from a representative
//! metrics snapshot, checks metric drift against the previous snapshot,
//! and combines exploit (portfolio) and explore (shadow experiment)
//! decisions under one shared, monotonically decreasing change budget —
//! exploitation has priority. Extreme drift is a hard circuit breaker: a
//! do-nothing bundle. High drift disables exploration only.
//!
//! All sub-results merge into one hash-locked bundle whose `bundle_hash`
//! covers the policy, baseline, portfolio, and experiment sub-hashes; a
//! single-field change anywhere invalidates the whole bundle's hash,
//! which is the mechanism tests use to assert full determinism.
//!
//! Log codes:
//! - `TP-ROUTER-001`: bundle built
//! - `TP-ROUTER-002`: drift circuit breaker tripped

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::baseline::{compute_baseline_signature, MetricsSnapshot};
use crate::canonical::{content_hash, DOMAIN_BUNDLE};
use crate::config::TuningPolicy;
use crate::effect_store::EffectStore;
use crate::envelope::{KnobValue, TuningEnvelope};
use crate::gating::{CooldownStore, StabilizationTracker};
use crate::governance::{PromotionOverlay, SafeSetStore};
use crate::optimizer::{
    run_portfolio, MetricDirection, OptimizerContext, OptimizerRequest, PortfolioOutcome,
};

/// Schema version stamped into bundles.
pub const BUNDLE_SCHEMA_VERSION: &str = "tuneplane.bundle.v1";

// ---------------------------------------------------------------------------
// Cycle decision
// ---------------------------------------------------------------------------

/// How the cycle was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleDecision {
    /// Exploit and explore both ran.
    Normal,
    /// High drift: exploitation only.
    NoExploration,
    /// Extreme drift: do-nothing bundle.
    CircuitBreaker,
}

impl CycleDecision {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::NoExploration => "no_exploration",
            Self::CircuitBreaker => "circuit_breaker",
        }
    }
}

impl fmt::Display for CycleDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One shadow experiment: a candidate value proposed for observation on a
/// knob with no same-bucket evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowExperiment {
    pub knob: String,
    pub value: KnobValue,
}

/// The hash-locked per-cycle decision bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningPlaneBundle {
    pub schema_version: String,
    pub cycle_id: String,
    pub decision: CycleDecision,
    pub baseline_key: String,
    pub drift: f64,
    pub policy_hash: String,
    pub baseline_hash: String,
    pub portfolio: BTreeMap<String, PortfolioOutcome>,
    pub portfolio_hash: String,
    pub experiments: BTreeMap<String, Vec<ShadowExperiment>>,
    pub experiments_hash: String,
    /// Covers policy, baseline, portfolio, and experiment sub-hashes.
    pub bundle_hash: String,
}

impl TuningPlaneBundle {
    /// Recompute the bundle hash with `bundle_hash` blanked.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut blanked = self.clone();
        blanked.bundle_hash = String::new();
        content_hash(DOMAIN_BUNDLE, &blanked)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Read-only stores the router consults each cycle.
#[derive(Debug, Clone, Copy)]
pub struct RouterStores<'a> {
    pub effect_store: &'a EffectStore,
    pub cooldowns: &'a CooldownStore,
    pub safe_sets: Option<&'a SafeSetStore>,
    pub overlay: Option<&'a PromotionOverlay>,
    /// Ledger clock for cooldown and safe-set expiry.
    pub now_idx: u64,
}

/// Per-cycle orchestrator state: the previous snapshot for drift
/// comparison and the stabilization tracker it ages exactly once per
/// cycle.
#[derive(Debug)]
pub struct TuningPlaneRouter {
    policy: TuningPolicy,
    objective_metric: String,
    direction: MetricDirection,
    prev_snapshot: Option<MetricsSnapshot>,
    stabilization: StabilizationTracker,
}

impl TuningPlaneRouter {
    #[must_use]
    pub fn new(policy: TuningPolicy, objective_metric: impl Into<String>, direction: MetricDirection) -> Self {
        Self {
            policy,
            objective_metric: objective_metric.into(),
            direction,
            prev_snapshot: None,
            stabilization: StabilizationTracker::new(),
        }
    }

    #[must_use]
    pub fn stabilization(&self) -> &StabilizationTracker {
        &self.stabilization
    }

    pub fn stabilization_mut(&mut self) -> &mut StabilizationTracker {
        &mut self.stabilization
    }

    /// Build the per-cycle decision bundle.
    pub fn build_tuning_plane_bundle(
        &mut self,
        cycle_id: &str,
        snapshot: &MetricsSnapshot,
        envelopes: &BTreeMap<String, TuningEnvelope>,
        stores: &RouterStores<'_>,
    ) -> Result<TuningPlaneBundle, serde_json::Error> {
        // The one and only aging point for stabilization counters.
        self.stabilization.tick_cycle();

        let baseline = compute_baseline_signature(snapshot);
        let drift = metric_drift(self.prev_snapshot.as_ref(), snapshot);
        self.prev_snapshot = Some(snapshot.clone());

        let policy_hash = content_hash(DOMAIN_BUNDLE, &self.policy)?;
        let baseline_hash = content_hash(DOMAIN_BUNDLE, baseline.dims())?;

        if drift >= self.policy.router.drift_extreme_threshold {
            warn!(
                code = "TP-ROUTER-002",
                cycle = cycle_id,
                drift,
                "extreme drift, emitting do-nothing bundle"
            );
            return seal_bundle(TuningPlaneBundle {
                schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
                cycle_id: cycle_id.to_string(),
                decision: CycleDecision::CircuitBreaker,
                baseline_key: baseline.key(),
                drift,
                policy_hash,
                baseline_hash,
                portfolio: BTreeMap::new(),
                portfolio_hash: String::new(),
                experiments: BTreeMap::new(),
                experiments_hash: String::new(),
                bundle_hash: String::new(),
            });
        }

        let decision = if drift >= self.policy.router.drift_high_threshold {
            CycleDecision::NoExploration
        } else {
            CycleDecision::Normal
        };

        // Exploit first, under the shared budget.
        let mut budget_remaining = self.policy.router.max_changes_per_cycle;
        let mut portfolio = BTreeMap::new();
        for (module_id, envelope) in envelopes {
            let request = OptimizerRequest {
                envelope,
                baseline: &baseline,
                metric: &self.objective_metric,
                direction: self.direction,
                shadow: &self.policy.shadow,
                shadow_only: false,
                max_changes: budget_remaining,
            };
            let ctx = OptimizerContext {
                effect_store: stores.effect_store,
                cooldowns: stores.cooldowns,
                safe_sets: stores.safe_sets,
                overlay: stores.overlay,
                now_idx: stores.now_idx,
            };
            let mut outcome = run_portfolio(&request, &ctx);
            budget_remaining = budget_remaining.saturating_sub(outcome.applied.len() as u32);
            // Standing promoted defaults fill gaps without consuming budget
            // and without overriding any explicit selection.
            if let Some(overlay) = stores.overlay {
                overlay.fill_missing(module_id, &baseline.key(), &mut outcome.applied);
            }
            portfolio.insert(module_id.clone(), outcome);
        }

        // Explore with whatever budget is left, unless drift is high.
        let mut experiments: BTreeMap<String, Vec<ShadowExperiment>> = BTreeMap::new();
        if decision == CycleDecision::Normal {
            let mut experiment_budget = self
                .policy
                .router
                .max_experiments_per_cycle
                .min(budget_remaining);
            'modules: for (module_id, envelope) in envelopes {
                for (knob, spec) in &envelope.knobs {
                    if experiment_budget == 0 {
                        break 'modules;
                    }
                    let candidates = spec.candidates();
                    if candidates.len() < 2 {
                        continue;
                    }
                    let has_same_bucket_stats = candidates.iter().any(|value| {
                        stores
                            .effect_store
                            .get_effect_stats(
                                module_id,
                                knob,
                                value,
                                &baseline,
                                &self.objective_metric,
                            )
                            .is_some()
                    });
                    if has_same_bucket_stats {
                        continue;
                    }
                    // First non-default candidate in lexicographic order,
                    // restricted to an active safe set when one stands.
                    let candidate = candidates
                        .into_iter()
                        .filter(|value| *value != spec.default)
                        .find(|value| {
                            stores
                                .safe_sets
                                .and_then(|safe| {
                                    safe.permits(
                                        module_id,
                                        knob,
                                        &baseline.key(),
                                        value,
                                        stores.now_idx,
                                    )
                                })
                                .unwrap_or(true)
                        });
                    if let Some(value) = candidate {
                        experiments.entry(module_id.clone()).or_default().push(
                            ShadowExperiment {
                                knob: knob.clone(),
                                value,
                            },
                        );
                        experiment_budget -= 1;
                    }
                }
            }
        }

        let portfolio_hash = content_hash(DOMAIN_BUNDLE, &portfolio)?;
        let experiments_hash = content_hash(DOMAIN_BUNDLE, &experiments)?;
        let bundle = seal_bundle(TuningPlaneBundle {
            schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
            cycle_id: cycle_id.to_string(),
            decision,
            baseline_key: baseline.key(),
            drift,
            policy_hash,
            baseline_hash,
            portfolio,
            portfolio_hash,
            experiments,
            experiments_hash,
            bundle_hash: String::new(),
        })?;
        info!(
            code = "TP-ROUTER-001",
            cycle = cycle_id,
            decision = %bundle.decision,
            modules = bundle.portfolio.len(),
            "bundle built"
        );
        Ok(bundle)
    }
}

fn seal_bundle(mut bundle: TuningPlaneBundle) -> Result<TuningPlaneBundle, serde_json::Error> {
    bundle.bundle_hash = bundle.compute_hash()?;
    Ok(bundle)
}

/// Average absolute relative change over numeric metrics shared by both
/// snapshots. No previous snapshot means no drift.
#[must_use]
pub fn metric_drift(prev: Option<&MetricsSnapshot>, current: &MetricsSnapshot) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };
    let mut shared = 0u32;
    let mut total = 0.0;
    for (metric, prev_value) in prev {
        let Some(prev_num) = prev_value.as_number() else {
            continue;
        };
        let Some(current_num) = current.get(metric).and_then(|v| v.as_number()) else {
            continue;
        };
        shared += 1;
        total += ((current_num - prev_num) / prev_num.abs().max(1e-9)).abs();
    }
    if shared == 0 {
        0.0
    } else {
        total / f64::from(shared)
    }
}
