//! Explicit policy configuration for the tuning plane.
//!
//! There are no process-wide defaults, env-var-derived paths, or hidden
//! globals: every component receives the policy struct it needs from its
//! caller. All fields carry documented defaults so a zero-config
//! `TuningPolicy::default()` is a usable, conservative configuration.

use serde::{Deserialize, Serialize};

/// Statistical and history-derived gates for the promotion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernancePolicy {
    /// Minimum effect-store sample count before a candidate may be proposed.
    pub min_samples: u64,
    /// Minimum z-score (|mean| / standard error) for proposal.
    pub z_threshold: f64,
    /// Minimum absolute mean effect for proposal.
    pub min_abs_effect: f64,
    /// Exact-key rollback rate above which candidates are vetoed and
    /// cooldowns are set.
    pub max_rollback_rate: f64,
    /// Cooldown duration, in ledger indices.
    pub cooldown_cycles: u64,
    /// Minimum attempt count before a value may enter a safe set.
    pub min_attempts: u64,
    /// Maximum rollback rate tolerated inside a safe set.
    pub safe_max_rollback_rate: f64,
    /// Safe-set entries decay after this many ledger indices.
    pub safe_set_decay_cycles: u64,
    /// Optional effect-store guardrail metric consulted by the safe-set
    /// builder; a value whose same-bucket mean on this metric is harmful
    /// (positive, lower-is-better) is vetoed. Absent stats never veto.
    pub guardrail_metric: Option<String>,
    /// Bounded additive score by which the promotion overlay biases
    /// optimizer tie-breaks toward promoted values. Never a hard override.
    pub promotion_bias: f64,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self {
            min_samples: 5,
            z_threshold: 2.0,
            min_abs_effect: 0.5,
            max_rollback_rate: 0.3,
            cooldown_cycles: 50,
            min_attempts: 3,
            safe_max_rollback_rate: 0.1,
            safe_set_decay_cycles: 500,
            guardrail_metric: None,
            promotion_bias: 1e-9,
        }
    }
}

/// Cross-bucket shadow-inference gates.
///
/// The similarity/penalty constants are policy defaults preserved from the
/// original control plane; they are configurable, not hard-coded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowPolicy {
    /// Enable cross-bucket shadow inference for knobs with no same-bucket
    /// evidence. Cross-bucket estimates are never applied.
    pub enable_cross_bucket_shadow: bool,
    /// Minimum baseline-similarity score for a donor bucket.
    pub min_similarity: f64,
    /// Fixed damping applied to the similarity-weighted donor mean.
    pub shadow_penalty: f64,
    /// Minimum donor z-score for cross-bucket inference.
    pub z_threshold_shadow: f64,
}

impl Default for ShadowPolicy {
    fn default() -> Self {
        Self {
            enable_cross_bucket_shadow: false,
            min_similarity: 0.75,
            shadow_penalty: 0.5,
            z_threshold_shadow: 3.0,
        }
    }
}

/// Canary observation and rollback policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryPolicy {
    /// Number of metrics-snapshot polls per observation window.
    pub canary_cycles: u32,
    /// Degradation score above which the change is rolled back.
    pub rollback_degraded_score_threshold: f64,
    /// Weight of relative latency degradation in the score.
    pub latency_weight: f64,
    /// Weight of relative cost degradation in the score.
    pub cost_weight: f64,
    /// Weight of relative error-rate degradation in the score.
    pub error_rate_weight: f64,
    /// Magnitude of the negative-evidence sample recorded against a
    /// rolled-back value.
    pub rollback_penalty: f64,
    /// Snapshot failures tolerated before the observation loop aborts.
    /// A wedged or failing provider must not wedge the whole cycle.
    pub max_snapshot_failures: u32,
}

impl Default for CanaryPolicy {
    fn default() -> Self {
        Self {
            canary_cycles: 3,
            rollback_degraded_score_threshold: 0.2,
            latency_weight: 0.4,
            cost_weight: 0.2,
            error_rate_weight: 0.4,
            rollback_penalty: 1.0,
            max_snapshot_failures: 3,
        }
    }
}

/// Per-cycle routing policy: shared change budget and drift circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterPolicy {
    /// Shared, monotonically decreasing change budget per cycle.
    /// Exploitation has priority over exploration.
    pub max_changes_per_cycle: u32,
    /// Drift at or above this disables exploration (exploitation continues).
    pub drift_high_threshold: f64,
    /// Drift at or above this emits a do-nothing bundle.
    pub drift_extreme_threshold: f64,
    /// Upper bound on shadow experiments proposed per cycle.
    pub max_experiments_per_cycle: u32,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            max_changes_per_cycle: 4,
            drift_high_threshold: 0.25,
            drift_extreme_threshold: 0.6,
            max_experiments_per_cycle: 2,
        }
    }
}

/// Complete tuning-plane policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningPolicy {
    pub governance: GovernancePolicy,
    pub shadow: ShadowPolicy,
    pub canary: CanaryPolicy,
    pub router: RouterPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_preserve_shadow_inference_constants() {
        let shadow = ShadowPolicy::default();
        assert_eq!(shadow.min_similarity, 0.75);
        assert_eq!(shadow.shadow_penalty, 0.5);
        assert_eq!(shadow.z_threshold_shadow, 3.0);
        assert!(!shadow.enable_cross_bucket_shadow);
    }

    #[test]
    fn degradation_weights_sum_to_one() {
        let canary = CanaryPolicy::default();
        let total = canary.latency_weight + canary.cost_weight + canary.error_rate_weight;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn policy_roundtrips_through_json() {
        let policy = TuningPolicy::default();
        let json = serde_json::to_string(&policy).expect("serialize");
        let restored: TuningPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(policy, restored);
    }

    #[test]
    fn partial_policy_fills_defaults() {
        let policy: TuningPolicy =
            serde_json::from_str(r#"{"governance": {"min_samples": 10}}"#).expect("deserialize");
        assert_eq!(policy.governance.min_samples, 10);
        assert_eq!(policy.governance.cooldown_cycles, 50);
        assert_eq!(policy.router.max_changes_per_cycle, 4);
    }
}
