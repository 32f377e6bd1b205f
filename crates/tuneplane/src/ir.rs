//! Immutable, content-hashed decision artifacts.
//!
//! A [`TuningIR`] describes one proposed or applied set of knob
//! assignments; a [`RollbackIR`] records a reverted change and the
//! evidence that triggered it. Both are hashed over their full canonical
//! serialization with the hash field blanked, and are never mutated — a
//! later decision is a new IR. No wall-clock data enters either artifact,
//! so identical inputs always produce identical hashes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::baseline::MetricsSnapshot;
use crate::canonical::{content_hash, DOMAIN_IR, DOMAIN_METRICS, DOMAIN_ROLLBACK};
use crate::envelope::KnobValue;

/// Schema version stamped into every IR.
pub const IR_SCHEMA_VERSION: &str = "tuneplane.ir.v1";

// ---------------------------------------------------------------------------
// TuningMode
// ---------------------------------------------------------------------------

/// How an IR's assignments are intended to take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Suggestion only; never applied to the live module.
    ShadowTune,
    /// Experimentally applied under canary observation.
    AppliedTune,
    /// A standing promoted default. Requires an evidence bundle hash.
    PromotedTune,
    /// A promotion executing as a budgeted canary.
    PromotionCanary,
}

impl TuningMode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ShadowTune => "shadow_tune",
            Self::AppliedTune => "applied_tune",
            Self::PromotedTune => "promoted_tune",
            Self::PromotionCanary => "promotion_canary",
        }
    }

    /// Shadow IRs never mutate live state.
    #[must_use]
    pub fn is_shadow(self) -> bool {
        matches!(self, Self::ShadowTune)
    }
}

impl fmt::Display for TuningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// IrError
// ---------------------------------------------------------------------------

/// Errors constructing an IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    #[error("promoted_tune requires a non-empty evidence_bundle_hash")]
    MissingEvidenceBundle,
    #[error("empty assignment map")]
    EmptyAssignments,
    #[error("failed to serialize IR for hashing: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// TuningIR
// ---------------------------------------------------------------------------

/// One immutable tuning decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningIR {
    pub schema_version: String,
    /// Content hash of this IR with this field blanked.
    pub ir_hash: String,
    pub source_cycle_id: String,
    pub mode: TuningMode,
    pub module_id: String,
    pub node_id: String,
    pub assignments: BTreeMap<String, KnobValue>,
    pub reason_tags: Vec<String>,
    /// Hash of the evidence bundle justifying a promotion; may be empty for
    /// experimental modes.
    pub evidence_bundle_hash: String,
}

impl TuningIR {
    /// Construct an IR, computing its content hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_cycle_id: impl Into<String>,
        mode: TuningMode,
        module_id: impl Into<String>,
        node_id: impl Into<String>,
        assignments: BTreeMap<String, KnobValue>,
        reason_tags: Vec<String>,
        evidence_bundle_hash: impl Into<String>,
    ) -> Result<Self, IrError> {
        let evidence_bundle_hash = evidence_bundle_hash.into();
        if mode == TuningMode::PromotedTune && evidence_bundle_hash.is_empty() {
            return Err(IrError::MissingEvidenceBundle);
        }
        if assignments.is_empty() {
            return Err(IrError::EmptyAssignments);
        }
        let mut ir = Self {
            schema_version: IR_SCHEMA_VERSION.to_string(),
            ir_hash: String::new(),
            source_cycle_id: source_cycle_id.into(),
            mode,
            module_id: module_id.into(),
            node_id: node_id.into(),
            assignments,
            reason_tags,
            evidence_bundle_hash,
        };
        ir.ir_hash = content_hash(DOMAIN_IR, &ir)?;
        Ok(ir)
    }

    /// Recompute the content hash with `ir_hash` blanked.
    pub fn compute_hash(&self) -> Result<String, IrError> {
        let mut blanked = self.clone();
        blanked.ir_hash = String::new();
        Ok(content_hash(DOMAIN_IR, &blanked)?)
    }
}

// ---------------------------------------------------------------------------
// RollbackIR
// ---------------------------------------------------------------------------

/// The immutable record of a reverted change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackIR {
    pub schema_version: String,
    /// Content hash of this record with this field blanked.
    pub rollback_hash: String,
    pub module_id: String,
    /// Hash of the IR whose application was reverted.
    pub source_ir_hash: String,
    pub attempted_assignments: BTreeMap<String, KnobValue>,
    pub reverted_assignments: BTreeMap<String, KnobValue>,
    pub reason: String,
    pub before_metrics_hash: String,
    pub after_metrics_hash: String,
}

impl RollbackIR {
    pub fn new(
        module_id: impl Into<String>,
        source_ir_hash: impl Into<String>,
        attempted_assignments: BTreeMap<String, KnobValue>,
        reverted_assignments: BTreeMap<String, KnobValue>,
        reason: impl Into<String>,
        before_metrics_hash: impl Into<String>,
        after_metrics_hash: impl Into<String>,
    ) -> Result<Self, IrError> {
        let mut ir = Self {
            schema_version: IR_SCHEMA_VERSION.to_string(),
            rollback_hash: String::new(),
            module_id: module_id.into(),
            source_ir_hash: source_ir_hash.into(),
            attempted_assignments,
            reverted_assignments,
            reason: reason.into(),
            before_metrics_hash: before_metrics_hash.into(),
            after_metrics_hash: after_metrics_hash.into(),
        };
        ir.rollback_hash = content_hash(DOMAIN_ROLLBACK, &ir)?;
        Ok(ir)
    }

    /// Recompute the content hash with `rollback_hash` blanked.
    pub fn compute_hash(&self) -> Result<String, IrError> {
        let mut blanked = self.clone();
        blanked.rollback_hash = String::new();
        Ok(content_hash(DOMAIN_ROLLBACK, &blanked)?)
    }
}

/// Content hash of a metrics snapshot, for rollback evidence binding.
pub fn metrics_hash(snapshot: &MetricsSnapshot) -> Result<String, serde_json::Error> {
    content_hash(DOMAIN_METRICS, snapshot)
}
