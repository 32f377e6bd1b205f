//! Independent gating policies a knob-change candidate must pass.
//!
//! Each gate is a standalone policy with its own state and denial reason:
//! capability (explicit allow-sets), stabilization (cycles since last
//! change), and cooldown (ledger-index-scoped suppression). Gate denials
//! are recorded per knob and are never fatal to a batch.

pub mod capability;
pub mod cooldown;
pub mod stabilization;

pub use capability::CapabilityRegistry;
pub use cooldown::{CooldownEntry, CooldownStore};
pub use stabilization::StabilizationTracker;
