//! Stabilization windows: a knob must sit unchanged for a declared number
//! of cycles before it may change again.
//!
//! An unseen key is treated as stabilized — conservative toward allowing
//! first-time changes, not blocking them. `tick_cycle` is the only
//! aging path and is called exactly once per control-loop iteration by the
//! router.

use std::collections::BTreeMap;

/// Tracks cycles since the last change per (module, knob).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StabilizationTracker {
    cycles_since_change: BTreeMap<(String, String), u64>,
}

impl StabilizationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycles since the last recorded change, if the key has ever changed.
    #[must_use]
    pub fn cycles_since_change(&self, module: &str, knob: &str) -> Option<u64> {
        self.cycles_since_change
            .get(&(module.to_string(), knob.to_string()))
            .copied()
    }

    /// Whether a change is permitted given the knob's requirement.
    #[must_use]
    pub fn is_stabilized(&self, module: &str, knob: &str, required_cycles: u64) -> bool {
        match self.cycles_since_change(module, knob) {
            None => true,
            Some(cycles) => cycles >= required_cycles,
        }
    }

    /// Record a change: the counter resets to zero.
    pub fn note_change(&mut self, module: &str, knob: &str) {
        self.cycles_since_change
            .insert((module.to_string(), knob.to_string()), 0);
    }

    /// Age every counter by one cycle.
    pub fn tick_cycle(&mut self) {
        for counter in self.cycles_since_change.values_mut() {
            *counter = counter.saturating_add(1);
        }
    }
}
