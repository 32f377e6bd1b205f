//! Per-bucket online effect statistics.
//!
//! The store accumulates Welford-style running mean/variance of observed
//! `after - before` metric deltas, keyed by
//! `(module, knob, value, baseline, metric)`. Isolating effects per
//! context bucket means an improvement observed under light load is never
//! used to justify a change under heavy load.
//!
//! Persistence is a hash-verified whole-file snapshot. A corrupt snapshot
//! (hash mismatch or parse failure) loads as an empty store: corrupt state
//! must never block the control loop, only forfeit accumulated evidence.
//!
//! Log codes:
//! - `TP-EFFECT-001`: snapshot loaded
//! - `TP-EFFECT-002`: snapshot rejected, degrading to empty

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::baseline::{BaselineSignature, MetricsSnapshot};
use crate::canonical::{content_hash, DOMAIN_EFFECT_STORE};
use crate::envelope::KnobValue;
use crate::persist::{atomic_write_json, PersistError};

/// Schema version written into snapshot files.
pub const EFFECT_STORE_SCHEMA_VERSION: &str = "tuneplane.effect-store.v1";

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Welford online accumulator: count, running mean, and second moment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectAccumulator {
    pub n: u64,
    pub mean: f64,
    pub m2: f64,
}

impl EffectAccumulator {
    /// Fold one delta into the accumulator.
    pub fn update(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    /// Sample variance; zero below two samples.
    #[must_use]
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }
}

/// Read-side view of one accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectStats {
    pub n: u64,
    pub mean: f64,
    pub variance: f64,
}

impl EffectStats {
    /// z-score: |mean| over the standard error. Infinite when the variance
    /// is zero and the mean non-zero.
    #[must_use]
    pub fn z_score(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let variance = self.variance;
        if variance <= 0.0 {
            return if self.mean == 0.0 { 0.0 } else { f64::INFINITY };
        }
        self.mean.abs() / (variance / self.n as f64).sqrt()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

fn bucket_key(module: &str, knob: &str, value_key: &str, baseline_key: &str) -> String {
    format!("{module}::{knob}::{value_key}::{baseline_key}")
}

/// Accumulated effect evidence for every observed (module, knob, value,
/// baseline, metric) tuple.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectStore {
    /// `module::knob::value::baseline` -> metric -> accumulator.
    stats: BTreeMap<String, BTreeMap<String, EffectAccumulator>>,
}

impl EffectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.stats.len()
    }

    /// Record one observed delta for a single metric.
    pub fn record_sample(
        &mut self,
        module: &str,
        knob: &str,
        value: &KnobValue,
        baseline: &BaselineSignature,
        metric: &str,
        delta: f64,
    ) {
        let key = bucket_key(module, knob, &value.key_string(), &baseline.key());
        self.stats
            .entry(key)
            .or_default()
            .entry(metric.to_string())
            .or_default()
            .update(delta);
    }

    /// Record `after - before` deltas for every numeric metric present in
    /// both snapshots.
    pub fn record_effect(
        &mut self,
        module: &str,
        knob: &str,
        value: &KnobValue,
        baseline: &BaselineSignature,
        before: &MetricsSnapshot,
        after: &MetricsSnapshot,
    ) {
        for (metric, before_value) in before {
            let Some(before_num) = before_value.as_number() else {
                continue;
            };
            let Some(after_num) = after.get(metric).and_then(|v| v.as_number()) else {
                continue;
            };
            self.record_sample(module, knob, value, baseline, metric, after_num - before_num);
        }
    }

    /// Statistics for one exact key, if any samples exist.
    #[must_use]
    pub fn get_effect_stats(
        &self,
        module: &str,
        knob: &str,
        value: &KnobValue,
        baseline: &BaselineSignature,
        metric: &str,
    ) -> Option<EffectStats> {
        let key = bucket_key(module, knob, &value.key_string(), &baseline.key());
        let acc = self.stats.get(&key)?.get(metric)?;
        Some(EffectStats {
            n: acc.n,
            mean: acc.mean,
            variance: acc.variance(),
        })
    }

    /// All baseline buckets with evidence for `(module, knob, value)` on
    /// `metric`, in sorted key order.
    #[must_use]
    pub fn buckets_for(
        &self,
        module: &str,
        knob: &str,
        value: &KnobValue,
        metric: &str,
    ) -> Vec<(BaselineSignature, EffectStats)> {
        let prefix = format!("{module}::{knob}::{}::", value.key_string());
        self.stats
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, metrics)| {
                let baseline_key = &key[prefix.len()..];
                let acc = metrics.get(metric)?;
                Some((
                    BaselineSignature::from_key(baseline_key),
                    EffectStats {
                        n: acc.n,
                        mean: acc.mean,
                        variance: acc.variance(),
                    },
                ))
            })
            .collect()
    }

    // -- Persistence --------------------------------------------------------

    /// Save a hash-verified snapshot atomically.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let mut file = EffectStoreFile {
            schema_version: EFFECT_STORE_SCHEMA_VERSION.to_string(),
            content_hash: String::new(),
            stats: self.stats.clone(),
        };
        file.content_hash = content_hash(DOMAIN_EFFECT_STORE, &file)?;
        atomic_write_json(path, &file)
    }

    /// Load a snapshot. A missing, unparsable, or hash-mismatched file
    /// loads as an empty store.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(source) => {
                if source.kind() != std::io::ErrorKind::NotFound {
                    warn!(code = "TP-EFFECT-002", path = %path.display(), error = %source, "effect store unreadable, degrading to empty");
                }
                return Self::default();
            }
        };
        let file: EffectStoreFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!(code = "TP-EFFECT-002", path = %path.display(), error = %e, "effect store unparsable, degrading to empty");
                return Self::default();
            }
        };
        let mut blanked = file.clone();
        blanked.content_hash = String::new();
        match content_hash(DOMAIN_EFFECT_STORE, &blanked) {
            Ok(expected) if expected == file.content_hash => {
                info!(code = "TP-EFFECT-001", buckets = file.stats.len(), "effect store loaded");
                Self { stats: file.stats }
            }
            _ => {
                warn!(code = "TP-EFFECT-002", path = %path.display(), "effect store hash mismatch, degrading to empty");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EffectStoreFile {
    schema_version: String,
    content_hash: String,
    stats: BTreeMap<String, BTreeMap<String, EffectAccumulator>>,
}
