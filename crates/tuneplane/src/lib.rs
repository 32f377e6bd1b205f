//! Deterministic runtime tuning control plane.
//!
//! `tuneplane` decides, applies, monitors, and — when necessary — reverts
//! knob assignments to live modules, while keeping a tamper-evident audit
//! trail and a statistically gated path from experimental change to
//! permanent promotion.
//!
//! The crate is organized dependency-order, leaves first:
//!
//! - [`ledger`] — append-only, hash-chained evidence log.
//! - [`baseline`] / [`effect_store`] — context bucketing and per-bucket
//!   online effect statistics.
//! - [`gating`] — capability, stabilization, and cooldown policies.
//! - [`envelope`] / [`ir`] — declared knob specs and immutable,
//!   content-hashed decision artifacts.
//! - [`optimizer`] — budget-constrained deterministic knob selection.
//! - [`canary`] — bounded-observation apply with automatic rollback.
//! - [`governance`] — proposal scanning, safe sets, cooldown derivation,
//!   and budgeted promotion execution with revocation.
//! - [`router`] — the per-cycle orchestrator producing one hash-locked
//!   decision bundle.
//!
//! Every deterministic selection iterates in sorted-key order so two runs
//! over identical persisted state produce byte-identical output hashes.
//! Nothing in this crate terminates the host process: every failure mode
//! resolves to a typed result the caller inspects, and every attempted
//! action produces a ledger entry.

#![forbid(unsafe_code)]

pub mod baseline;
pub mod canary;
pub mod canonical;
pub mod config;
pub mod effect_store;
pub mod envelope;
pub mod gating;
pub mod governance;
pub mod ir;
pub mod ledger;
pub mod optimizer;
pub mod persist;
pub mod router;

pub use baseline::{compute_baseline_signature, BaselineSignature, MetricValue, MetricsSnapshot};
pub use canary::{AppliedState, CanaryOutcome, CanaryPhase, CanaryRunner, CancelToken};
pub use config::{CanaryPolicy, GovernancePolicy, RouterPolicy, ShadowPolicy, TuningPolicy};
pub use effect_store::{EffectStats, EffectStore};
pub use envelope::{KnobKind, KnobSpec, KnobValue, TuningEnvelope};
pub use ir::{RollbackIR, TuningIR, TuningMode};
pub use ledger::{FileLedger, LedgerEntry, LedgerError};
pub use optimizer::{MetricDirection, PortfolioOutcome, run_portfolio};
pub use router::{TuningPlaneBundle, TuningPlaneRouter};
