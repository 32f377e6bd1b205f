//! Canary application with automatic rollback.
//!
//! Every attempted [`TuningIR`] walks the state machine
//! `PROPOSED -> VALIDATED -> APPLIED -> OBSERVING -> {COMMITTED | ROLLED_BACK}`.
//! Validation failures are fatal for the attempt and produce no side
//! effects; gate denials reject individual knobs, not the whole IR. The
//! observation loop polls a caller-supplied metrics source and scores
//! degradation against the pre-change baseline; a degraded change is
//! reverted through the same apply path and a fixed negative-evidence
//! sample is recorded so future optimizer runs are biased away from it.
//!
//! The polling loop carries a cooperative cancellation token and a bounded
//! snapshot-failure budget: a wedged snapshot provider aborts the canary
//! (reverting the change) instead of wedging the whole cycle.
//!
//! Log codes:
//! - `TP-CANARY-001`: assignments applied
//! - `TP-CANARY-002`: rollback executed
//! - `TP-CANARY-003`: observation aborted

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::baseline::{BaselineSignature, MetricsSnapshot};
use crate::config::CanaryPolicy;
use crate::effect_store::EffectStore;
use crate::envelope::{KnobValue, TuningEnvelope};
use crate::gating::{CapabilityRegistry, StabilizationTracker};
use crate::ir::{metrics_hash, RollbackIR, TuningIR};
use crate::ledger::{base_provenance, FileLedger, LedgerError};
use crate::optimizer::MetricDirection;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Canary state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryPhase {
    Proposed,
    Validated,
    Applied,
    Observing,
    Committed,
    RolledBack,
}

impl CanaryPhase {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Validated => "validated",
            Self::Applied => "applied",
            Self::Observing => "observing",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for CanaryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Metrics source + cancellation
// ---------------------------------------------------------------------------

/// Caller-supplied metrics provider. `None` counts as a snapshot failure
/// against the canary's failure budget.
pub trait MetricsSource {
    fn snapshot(&mut self) -> Option<MetricsSnapshot>;
}

impl<F: FnMut() -> Option<MetricsSnapshot>> MetricsSource for F {
    fn snapshot(&mut self) -> Option<MetricsSnapshot> {
        self()
    }
}

/// Cooperative cancellation for the observation loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Applied state
// ---------------------------------------------------------------------------

/// Live knob assignments per module. The canary runner owns all mutation;
/// a knob with no explicit assignment reads as its envelope default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    assignments: BTreeMap<String, BTreeMap<String, KnobValue>>,
}

impl AppliedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a knob: explicit assignment or envelope default.
    #[must_use]
    pub fn current(&self, module: &str, knob: &str, envelope: &TuningEnvelope) -> Option<KnobValue> {
        if let Some(value) = self.assignments.get(module).and_then(|m| m.get(knob)) {
            return Some(value.clone());
        }
        envelope.knob(knob).map(|spec| spec.default.clone())
    }

    fn set(&mut self, module: &str, knob: &str, value: KnobValue) {
        self.assignments
            .entry(module.to_string())
            .or_default()
            .insert(knob.to_string(), value);
    }

    /// All explicit assignments for a module.
    #[must_use]
    pub fn module_assignments(&self, module: &str) -> BTreeMap<String, KnobValue> {
        self.assignments.get(module).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of one canary attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryOutcome {
    pub phase: CanaryPhase,
    pub ir_hash: String,
    /// Knobs actually applied, with the values that took effect.
    pub applied: BTreeMap<String, KnobValue>,
    /// Per-knob gate or validation rejections.
    pub rejected: BTreeMap<String, String>,
    pub degradation_score: f64,
    pub rollback: Option<RollbackIR>,
    /// Fatal-attempt reason (`invalid_ir:*`, `observation_aborted`, ...).
    pub failure_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate mode
// ---------------------------------------------------------------------------

/// Whether the stabilization gate is enforced during apply. Reverts bypass
/// it: the reset performed by the failed apply must not block its own
/// revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateMode {
    Enforce,
    Revert,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes canary attempts against shared control-plane state.
pub struct CanaryRunner<'a> {
    pub policy: &'a CanaryPolicy,
    pub capabilities: &'a CapabilityRegistry,
    pub stabilization: &'a mut StabilizationTracker,
    pub state: &'a mut AppliedState,
    pub effects: &'a mut EffectStore,
    pub ledger: &'a mut FileLedger,
}

impl CanaryRunner<'_> {
    /// Run one IR through the canary state machine.
    ///
    /// `objective_metric`/`direction` determine where rollback penalties
    /// land; the degradation score itself always combines latency, cost,
    /// and error rate.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &mut self,
        ir: &TuningIR,
        envelope: &TuningEnvelope,
        baseline: &BaselineSignature,
        objective_metric: &str,
        direction: MetricDirection,
        metrics: &mut dyn MetricsSource,
        cancel: &CancelToken,
    ) -> Result<CanaryOutcome, LedgerError> {
        // -- VALIDATED: structural check, fatal on failure, no side effects.
        for (knob, value) in &ir.assignments {
            if let Err(err) = envelope.validate_assignment(knob, value) {
                let reason = format!("invalid_ir:{}", err.reason());
                self.ledger.append(
                    "tuning_rejected",
                    json!({
                        "ir_hash": ir.ir_hash,
                        "module_id": ir.module_id,
                        "mode": ir.mode.label(),
                        "reason": reason,
                    }),
                    base_provenance("canary"),
                )?;
                return Ok(CanaryOutcome {
                    phase: CanaryPhase::Proposed,
                    ir_hash: ir.ir_hash.clone(),
                    applied: BTreeMap::new(),
                    rejected: BTreeMap::new(),
                    degradation_score: 0.0,
                    rollback: None,
                    failure_reason: Some(reason),
                });
            }
        }

        // Pre-change snapshot anchors both observation and rollback evidence.
        let Some(before) = metrics.snapshot() else {
            let reason = "snapshot_unavailable".to_string();
            self.ledger.append(
                "tuning_rejected",
                json!({
                    "ir_hash": ir.ir_hash,
                    "module_id": ir.module_id,
                    "mode": ir.mode.label(),
                    "reason": reason,
                }),
                base_provenance("canary"),
            )?;
            return Ok(CanaryOutcome {
                phase: CanaryPhase::Validated,
                ir_hash: ir.ir_hash.clone(),
                applied: BTreeMap::new(),
                rejected: BTreeMap::new(),
                degradation_score: 0.0,
                rollback: None,
                failure_reason: Some(reason),
            });
        };

        // -- APPLIED: per-knob gating; eligible knobs apply individually.
        let mut prior = BTreeMap::new();
        for knob in ir.assignments.keys() {
            if let Some(value) = self.state.current(&ir.module_id, knob, envelope) {
                prior.insert(knob.clone(), value);
            }
        }
        let (applied, rejected) =
            self.apply_assignments(ir, envelope, &ir.assignments, GateMode::Enforce);

        self.ledger.append(
            "tuning_applied",
            json!({
                "ir_hash": ir.ir_hash,
                "module_id": ir.module_id,
                "mode": ir.mode.label(),
                "baseline_key": baseline.key(),
                "applied": value_keys(&applied),
                "rejected": rejected,
            }),
            base_provenance("canary"),
        )?;

        if applied.is_empty() {
            return Ok(CanaryOutcome {
                phase: CanaryPhase::Validated,
                ir_hash: ir.ir_hash.clone(),
                applied,
                rejected,
                degradation_score: 0.0,
                rollback: None,
                failure_reason: None,
            });
        }

        info!(
            code = "TP-CANARY-001",
            module = %ir.module_id,
            mode = %ir.mode,
            knobs = applied.len(),
            "assignments applied"
        );

        // Shadow IRs never mutate live state, so there is nothing to observe.
        if ir.mode.is_shadow() {
            return Ok(CanaryOutcome {
                phase: CanaryPhase::Committed,
                ir_hash: ir.ir_hash.clone(),
                applied,
                rejected,
                degradation_score: 0.0,
                rollback: None,
                failure_reason: None,
            });
        }

        // -- OBSERVING: poll once per configured canary cycle.
        let mut last_snapshot: Option<MetricsSnapshot> = None;
        let mut snapshot_failures = 0u32;
        let mut aborted: Option<&'static str> = None;
        for _ in 0..self.policy.canary_cycles {
            if cancel.is_cancelled() {
                aborted = Some("cancelled");
                break;
            }
            match metrics.snapshot() {
                Some(snapshot) => last_snapshot = Some(snapshot),
                None => {
                    snapshot_failures += 1;
                    if snapshot_failures > self.policy.max_snapshot_failures {
                        aborted = Some("snapshot_failures_exhausted");
                        break;
                    }
                }
            }
        }

        let after = match (aborted, last_snapshot) {
            (None, Some(after)) => after,
            (reason, _) => {
                // Cancelled, wedged, or never observed: the change is not
                // kept without evidence.
                let reason = reason.unwrap_or("no_observation");
                warn!(code = "TP-CANARY-003", module = %ir.module_id, reason, "observation aborted");
                let rollback = self.execute_rollback(
                    ir,
                    envelope,
                    baseline,
                    &applied,
                    &prior,
                    &before,
                    &before,
                    &format!("observation_aborted:{reason}"),
                    false,
                    objective_metric,
                    direction,
                )?;
                return Ok(CanaryOutcome {
                    phase: CanaryPhase::RolledBack,
                    ir_hash: ir.ir_hash.clone(),
                    applied,
                    rejected,
                    degradation_score: 0.0,
                    rollback: Some(rollback),
                    failure_reason: Some(format!("observation_aborted:{reason}")),
                });
            }
        };

        // Record observed deltas per applied knob before deciding.
        for (knob, value) in &applied {
            self.effects
                .record_effect(&ir.module_id, knob, value, baseline, &before, &after);
        }

        let score = degradation_score(self.policy, &before, &after);
        if score > self.policy.rollback_degraded_score_threshold {
            let rollback = self.execute_rollback(
                ir,
                envelope,
                baseline,
                &applied,
                &prior,
                &before,
                &after,
                &format!("degraded_score:{score:.6}"),
                true,
                objective_metric,
                direction,
            )?;
            return Ok(CanaryOutcome {
                phase: CanaryPhase::RolledBack,
                ir_hash: ir.ir_hash.clone(),
                applied,
                rejected,
                degradation_score: score,
                rollback: Some(rollback),
                failure_reason: None,
            });
        }

        Ok(CanaryOutcome {
            phase: CanaryPhase::Committed,
            ir_hash: ir.ir_hash.clone(),
            applied,
            rejected,
            degradation_score: score,
            rollback: None,
            failure_reason: None,
        })
    }

    /// Apply assignments through the gate stack. Returns (applied, rejected).
    fn apply_assignments(
        &mut self,
        ir: &TuningIR,
        envelope: &TuningEnvelope,
        assignments: &BTreeMap<String, KnobValue>,
        gate_mode: GateMode,
    ) -> (BTreeMap<String, KnobValue>, BTreeMap<String, String>) {
        let mut applied = BTreeMap::new();
        let mut rejected = BTreeMap::new();
        for (knob, value) in assignments {
            let Some(spec) = envelope.knob(knob) else {
                rejected.insert(knob.clone(), format!("unknown_knob:{knob}"));
                continue;
            };
            if !spec.hot_apply {
                rejected.insert(knob.clone(), "not_hot_apply".to_string());
                continue;
            }
            if !self
                .capabilities
                .can_apply(&ir.module_id, spec.required_capability.as_deref())
            {
                let capability = spec.required_capability.as_deref().unwrap_or("");
                rejected.insert(knob.clone(), format!("missing_capability:{capability}"));
                continue;
            }
            if gate_mode == GateMode::Enforce
                && !self
                    .stabilization
                    .is_stabilized(&ir.module_id, knob, spec.stabilization_cycles)
            {
                rejected.insert(knob.clone(), "not_stabilized".to_string());
                continue;
            }
            if !ir.mode.is_shadow() {
                self.state.set(&ir.module_id, knob, value.clone());
                self.stabilization.note_change(&ir.module_id, knob);
            }
            applied.insert(knob.clone(), value.clone());
        }
        (applied, rejected)
    }

    /// Revert `applied` to `prior` through the same apply path, write the
    /// rollback artifacts, and (for degradations) record negative evidence.
    #[allow(clippy::too_many_arguments)]
    fn execute_rollback(
        &mut self,
        ir: &TuningIR,
        envelope: &TuningEnvelope,
        baseline: &BaselineSignature,
        applied: &BTreeMap<String, KnobValue>,
        prior: &BTreeMap<String, KnobValue>,
        before: &MetricsSnapshot,
        after: &MetricsSnapshot,
        reason: &str,
        record_penalty: bool,
        objective_metric: &str,
        direction: MetricDirection,
    ) -> Result<RollbackIR, LedgerError> {
        let reverted: BTreeMap<String, KnobValue> = prior
            .iter()
            .filter(|(knob, _)| applied.contains_key(*knob))
            .map(|(knob, value)| (knob.clone(), value.clone()))
            .collect();
        let (_, revert_rejected) =
            self.apply_assignments(ir, envelope, &reverted, GateMode::Revert);
        debug_assert!(revert_rejected.is_empty(), "prior values must re-apply");

        if record_penalty {
            // Fixed negative-evidence sample biases future optimizer runs
            // away from the attempted value.
            let penalty = self.policy.rollback_penalty * direction.harmful_sign();
            for (knob, value) in applied {
                self.effects.record_sample(
                    &ir.module_id,
                    knob,
                    value,
                    baseline,
                    objective_metric,
                    penalty,
                );
            }
        }

        let rollback = RollbackIR::new(
            ir.module_id.clone(),
            ir.ir_hash.clone(),
            applied.clone(),
            reverted,
            reason,
            metrics_hash(before).map_err(LedgerError::Serialize)?,
            metrics_hash(after).map_err(LedgerError::Serialize)?,
        )
        .map_err(|e| match e {
            crate::ir::IrError::Serialize(source) => LedgerError::Serialize(source),
            // Rollback construction has no other failure mode on this path.
            other => LedgerError::Corrupt {
                line: 0,
                reason: other.to_string(),
            },
        })?;

        warn!(
            code = "TP-CANARY-002",
            module = %ir.module_id,
            reason,
            rollback_hash = %&rollback.rollback_hash[..16.min(rollback.rollback_hash.len())],
            "rollback executed"
        );
        self.ledger.append(
            "tuning_rolled_back",
            json!({
                "ir_hash": ir.ir_hash,
                "module_id": ir.module_id,
                "mode": ir.mode.label(),
                "baseline_key": baseline.key(),
                "attempted": value_keys(applied),
                "reverted": value_keys(&rollback.reverted_assignments),
                "reason": reason,
                "rollback_hash": rollback.rollback_hash,
            }),
            base_provenance("canary"),
        )?;
        Ok(rollback)
    }
}

/// Project an assignment map to value-key strings for ledger payloads.
#[must_use]
pub fn value_keys(assignments: &BTreeMap<String, KnobValue>) -> BTreeMap<String, String> {
    assignments
        .iter()
        .map(|(knob, value)| (knob.clone(), value.key_string()))
        .collect()
}

/// Weighted degradation score of `after` relative to `before`.
///
/// Each component is the relative increase of a tracked metric, clamped at
/// zero so an improvement on one metric cannot mask a regression on
/// another. Metrics absent from either snapshot contribute nothing.
#[must_use]
pub fn degradation_score(
    policy: &CanaryPolicy,
    before: &MetricsSnapshot,
    after: &MetricsSnapshot,
) -> f64 {
    let component = |metric: &str| -> f64 {
        let Some(before_value) = before.get(metric).and_then(|v| v.as_number()) else {
            return 0.0;
        };
        let Some(after_value) = after.get(metric).and_then(|v| v.as_number()) else {
            return 0.0;
        };
        let denom = before_value.abs().max(1e-9);
        ((after_value - before_value) / denom).max(0.0)
    };
    policy.latency_weight * component("latency_ms")
        + policy.cost_weight * component("cost")
        + policy.error_rate_weight * component("error_rate")
}
