//! Budgeted execution of approved promotions.
//!
//! Approval is an explicit input — the executor never self-approves. Each
//! approved proposal runs as a `promotion_canary` IR through the canary
//! path under a [`BudgetState`]: a bounded canary count, a risk-unit
//! budget, and a concurrency cap on simultaneous perturbations. Every
//! attempt first writes a `promotion_applied` ledger entry, so the ledger
//! always shows intent before effect. Success upserts the policy item and
//! writes `promotion_canary_ok`; rollback marks any matching item revoked
//! (never deleted) and writes `promotion_rolled_back`.
//!
//! Log codes:
//! - `TP-PROMO-001`: promotion committed
//! - `TP-PROMO-002`: promotion rolled back and revoked
//! - `TP-PROMO-003`: proposal skipped (budget/concurrency)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::baseline::BaselineSignature;
use crate::canary::{AppliedState, CanaryPhase, CanaryRunner, CancelToken, MetricsSource};
use crate::config::CanaryPolicy;
use crate::effect_store::EffectStore;
use crate::envelope::TuningEnvelope;
use crate::gating::{CapabilityRegistry, StabilizationTracker};
use crate::governance::policy_store::{PromotionPolicyItem, PromotionPolicyStore};
use crate::governance::scanner::PromotionProposal;
use crate::ir::{TuningIR, TuningMode};
use crate::ledger::{base_provenance, FileLedger, LedgerError};
use crate::optimizer::MetricDirection;

// ---------------------------------------------------------------------------
// BudgetState
// ---------------------------------------------------------------------------

/// Mutable per-run budget counters, exclusively owned by the executing
/// governance pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// Promotion canaries still allowed this pass.
    pub canary_remaining: u32,
    /// Risk units still allowed; each attempted assignment costs one.
    pub risk_units_remaining: f64,
    /// Perturbations currently in flight.
    pub global_active_perturbations: u32,
    /// Cap on simultaneous perturbations.
    pub global_active_cap: u32,
}

impl BudgetState {
    #[must_use]
    pub fn new(canary_remaining: u32, risk_units_remaining: f64, global_active_cap: u32) -> Self {
        Self {
            canary_remaining,
            risk_units_remaining,
            global_active_perturbations: 0,
            global_active_cap,
        }
    }

    /// Why the next attempt cannot proceed, if anything.
    #[must_use]
    fn refusal(&self, risk_cost: f64) -> Option<&'static str> {
        if self.canary_remaining == 0 {
            Some("canary_budget_exhausted")
        } else if self.risk_units_remaining < risk_cost {
            Some("risk_budget_exhausted")
        } else if self.global_active_perturbations >= self.global_active_cap {
            Some("concurrency_cap_reached")
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal state of one approved proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted { promoted_at_idx: u64 },
    RolledBack { rollback_hash: String, revoked: usize },
    Skipped { reason: String },
    Rejected { reason: String },
}

/// Per-proposal execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionExecutionRecord {
    pub proposal_hash: String,
    pub module_id: String,
    pub knob: String,
    pub outcome: PromotionOutcome,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes externally approved proposals as budgeted promotion canaries.
pub struct PromotionExecutor<'a> {
    pub canary_policy: &'a CanaryPolicy,
    pub capabilities: &'a CapabilityRegistry,
    pub stabilization: &'a mut StabilizationTracker,
    pub state: &'a mut AppliedState,
    pub effects: &'a mut EffectStore,
    pub ledger: &'a mut FileLedger,
    pub policy_store: &'a mut PromotionPolicyStore,
    pub budget: BudgetState,
}

impl PromotionExecutor<'_> {
    /// Execute approved proposals in the given order.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_approved(
        &mut self,
        approved: &[PromotionProposal],
        envelopes: &BTreeMap<String, TuningEnvelope>,
        source_cycle_id: &str,
        direction: MetricDirection,
        metrics: &mut dyn MetricsSource,
        cancel: &CancelToken,
    ) -> Result<Vec<PromotionExecutionRecord>, LedgerError> {
        let mut records = Vec::with_capacity(approved.len());
        for proposal in approved {
            let record = self.execute_one(
                proposal,
                envelopes,
                source_cycle_id,
                direction,
                metrics,
                cancel,
            )?;
            records.push(record);
        }
        Ok(records)
    }

    fn execute_one(
        &mut self,
        proposal: &PromotionProposal,
        envelopes: &BTreeMap<String, TuningEnvelope>,
        source_cycle_id: &str,
        direction: MetricDirection,
        metrics: &mut dyn MetricsSource,
        cancel: &CancelToken,
    ) -> Result<PromotionExecutionRecord, LedgerError> {
        let record = |outcome| PromotionExecutionRecord {
            proposal_hash: proposal.proposal_hash.clone(),
            module_id: proposal.module_id.clone(),
            knob: proposal.knob.clone(),
            outcome,
        };

        let Some(envelope) = envelopes.get(&proposal.module_id) else {
            return Ok(record(PromotionOutcome::Rejected {
                reason: format!("unknown_module:{}", proposal.module_id),
            }));
        };

        let risk_cost = 1.0;
        if let Some(reason) = self.budget.refusal(risk_cost) {
            info!(code = "TP-PROMO-003", module = %proposal.module_id, knob = %proposal.knob, reason, "proposal skipped");
            return Ok(record(PromotionOutcome::Skipped {
                reason: reason.to_string(),
            }));
        }

        // Intent before effect: the attempt is on the record no matter what
        // happens next.
        self.ledger.append(
            "promotion_applied",
            json!({
                "proposal_hash": proposal.proposal_hash,
                "module_id": proposal.module_id,
                "knob": proposal.knob,
                "value": proposal.value.key_string(),
                "baseline_key": proposal.baseline_key,
                "metric": proposal.metric,
            }),
            base_provenance("promotion_executor"),
        )?;

        let mut assignments = BTreeMap::new();
        assignments.insert(proposal.knob.clone(), proposal.value.clone());
        let ir = match TuningIR::new(
            source_cycle_id,
            TuningMode::PromotionCanary,
            proposal.module_id.clone(),
            "governance",
            assignments,
            vec!["promotion".to_string()],
            proposal.proposal_hash.clone(),
        ) {
            Ok(ir) => ir,
            Err(e) => {
                return Ok(record(PromotionOutcome::Rejected {
                    reason: format!("ir_construction_failed:{e}"),
                }));
            }
        };

        self.budget.canary_remaining -= 1;
        self.budget.risk_units_remaining -= risk_cost;
        self.budget.global_active_perturbations += 1;

        let baseline = BaselineSignature::from_key(&proposal.baseline_key);
        let outcome = {
            let mut runner = CanaryRunner {
                policy: self.canary_policy,
                capabilities: self.capabilities,
                stabilization: self.stabilization,
                state: self.state,
                effects: self.effects,
                ledger: self.ledger,
            };
            runner.run(
                &ir,
                envelope,
                &baseline,
                &proposal.metric,
                direction,
                metrics,
                cancel,
            )?
        };

        self.budget.global_active_perturbations =
            self.budget.global_active_perturbations.saturating_sub(1);

        match outcome.phase {
            CanaryPhase::Committed if !outcome.applied.is_empty() => {
                let ok_entry = self.ledger.append(
                    "promotion_canary_ok",
                    json!({
                        "proposal_hash": proposal.proposal_hash,
                        "module_id": proposal.module_id,
                        "knob": proposal.knob,
                        "value": proposal.value.key_string(),
                        "baseline_key": proposal.baseline_key,
                        "ir_hash": ir.ir_hash,
                    }),
                    base_provenance("promotion_executor"),
                )?;
                let item = PromotionPolicyItem {
                    module_id: proposal.module_id.clone(),
                    knob: proposal.knob.clone(),
                    value: proposal.value.clone(),
                    baseline_key: proposal.baseline_key.clone(),
                    metric: proposal.metric.clone(),
                    promoted_at_idx: ok_entry.idx,
                    proposal_hash: proposal.proposal_hash.clone(),
                    revoked_at_idx: None,
                };
                self.policy_store.upsert(item);
                info!(code = "TP-PROMO-001", module = %proposal.module_id, knob = %proposal.knob, "promotion committed");
                Ok(record(PromotionOutcome::Promoted {
                    promoted_at_idx: ok_entry.idx,
                }))
            }
            CanaryPhase::RolledBack => {
                let rollback_hash = outcome
                    .rollback
                    .as_ref()
                    .map(|r| r.rollback_hash.clone())
                    .unwrap_or_default();
                let rb_entry = self.ledger.append(
                    "promotion_rolled_back",
                    json!({
                        "proposal_hash": proposal.proposal_hash,
                        "module_id": proposal.module_id,
                        "knob": proposal.knob,
                        "value": proposal.value.key_string(),
                        "baseline_key": proposal.baseline_key,
                        "rollback_hash": rollback_hash,
                    }),
                    base_provenance("promotion_executor"),
                )?;
                let revoked = self.policy_store.revoke(
                    &proposal.module_id,
                    &proposal.knob,
                    &proposal.baseline_key,
                    rb_entry.idx,
                );
                warn!(code = "TP-PROMO-002", module = %proposal.module_id, knob = %proposal.knob, revoked, "promotion rolled back");
                Ok(record(PromotionOutcome::RolledBack {
                    rollback_hash,
                    revoked,
                }))
            }
            _ => {
                // Validation failure or every knob gated out: the canary
                // already logged the attempt; no policy change follows.
                let reason = outcome
                    .failure_reason
                    .clone()
                    .or_else(|| {
                        outcome
                            .rejected
                            .values()
                            .next()
                            .map(|r| format!("gated:{r}"))
                    })
                    .unwrap_or_else(|| "not_applied".to_string());
                Ok(record(PromotionOutcome::Rejected { reason }))
            }
        }
    }
}
