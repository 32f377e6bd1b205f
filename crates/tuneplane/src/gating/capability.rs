//! Capability gating: explicit allow-sets, no ambient authority.
//!
//! A module may change a knob only if the capability the knob's spec
//! requires has been explicitly granted to that module. Nothing is granted
//! implicitly, and the check is a pure membership test.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Per-module capability grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRegistry {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a capability token to a module.
    pub fn grant(&mut self, module: &str, capability: &str) {
        self.grants
            .entry(module.to_string())
            .or_default()
            .insert(capability.to_string());
    }

    /// Remove a grant. Unknown grants are a no-op.
    pub fn revoke(&mut self, module: &str, capability: &str) {
        if let Some(set) = self.grants.get_mut(module) {
            set.remove(capability);
        }
    }

    /// Pure membership check: may `module` exercise `required`?
    ///
    /// A knob requiring no capability is always allowed.
    #[must_use]
    pub fn can_apply(&self, module: &str, required: Option<&str>) -> bool {
        match required {
            None => true,
            Some(capability) => self
                .grants
                .get(module)
                .is_some_and(|set| set.contains(capability)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_required_capability_always_allowed() {
        let registry = CapabilityRegistry::new();
        assert!(registry.can_apply("cache", None));
    }

    #[test]
    fn missing_grant_denies() {
        let registry = CapabilityRegistry::new();
        assert!(!registry.can_apply("cache", Some("tuning.write")));
    }

    #[test]
    fn explicit_grant_allows() {
        let mut registry = CapabilityRegistry::new();
        registry.grant("cache", "tuning.write");
        assert!(registry.can_apply("cache", Some("tuning.write")));
    }

    #[test]
    fn grants_do_not_leak_across_modules() {
        let mut registry = CapabilityRegistry::new();
        registry.grant("cache", "tuning.write");
        assert!(!registry.can_apply("scheduler", Some("tuning.write")));
    }

    #[test]
    fn revoke_removes_grant() {
        let mut registry = CapabilityRegistry::new();
        registry.grant("cache", "tuning.write");
        registry.revoke("cache", "tuning.write");
        assert!(!registry.can_apply("cache", Some("tuning.write")));
    }
}
