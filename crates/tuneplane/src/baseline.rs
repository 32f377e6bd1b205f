//! Baseline signatures: deterministic, low-cardinality context buckets.
//!
//! A signature is an ordered mapping of categorical bucket labels derived
//! from a metrics snapshot. Effect measurement is isolated per signature so
//! an improvement observed under light load is never used to justify a
//! change under heavy load.
//!
//! # Invariants
//!
//! - **INV-SIG-ORDER-FREE**: identical metrics maps yield identical
//!   signatures regardless of insertion order.
//! - **INV-SIG-OMIT-ABSENT**: absent metrics are omitted from the
//!   signature, never defaulted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single metric reading: numeric or categorical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Number(_) => None,
            Self::Text(s) => Some(s),
        }
    }
}

/// A metrics snapshot as supplied by the embedding runtime.
///
/// `BTreeMap` makes key order canonical by construction.
pub type MetricsSnapshot = BTreeMap<String, MetricValue>;

/// Convenience constructor for numeric-only snapshots.
#[must_use]
pub fn numeric_snapshot(pairs: &[(&str, f64)]) -> MetricsSnapshot {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), MetricValue::Number(*v)))
        .collect()
}

/// Ordered mapping of categorical bucket labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BaselineSignature {
    dims: BTreeMap<String, String>,
}

impl BaselineSignature {
    #[must_use]
    pub fn from_dims(dims: BTreeMap<String, String>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn dims(&self) -> &BTreeMap<String, String> {
        &self.dims
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Canonical string key: sorted `dim=label` pairs joined with `|`.
    /// The empty signature keys as `none`.
    #[must_use]
    pub fn key(&self) -> String {
        if self.dims.is_empty() {
            return "none".to_string();
        }
        self.dims
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Parse a canonical key back into a signature.
    #[must_use]
    pub fn from_key(key: &str) -> Self {
        if key.is_empty() || key == "none" {
            return Self::default();
        }
        let dims = key
            .split('|')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.to_string(), v.to_string()))
            })
            .collect();
        Self { dims }
    }

    /// Similarity score against another signature, over shared dimensions:
    /// exact label match scores 1.0, same-leading-token "adjacent" labels
    /// score 0.5, anything else 0.0; the result is the average over shared
    /// dimensions. No shared dimensions scores 0.0.
    #[must_use]
    pub fn similarity(&self, other: &Self) -> f64 {
        let mut shared = 0u32;
        let mut total = 0.0f64;
        for (dim, label) in &self.dims {
            let Some(other_label) = other.dims.get(dim) else {
                continue;
            };
            shared += 1;
            if label == other_label {
                total += 1.0;
            } else if leading_token(label) == leading_token(other_label) {
                total += 0.5;
            }
        }
        if shared == 0 {
            0.0
        } else {
            total / f64::from(shared)
        }
    }
}

impl fmt::Display for BaselineSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn leading_token(label: &str) -> &str {
    label.split('_').next().unwrap_or(label)
}

/// Bucket a metrics snapshot into a baseline signature.
///
/// - `queue_depth`: `le_10` / `le_50` / `gt_50`
/// - `input_size`: `le_1k` / `le_100k` / `gt_100k`
/// - `mode`, `time_window`: passed through verbatim when textual
///
/// Absent fields are omitted.
#[must_use]
pub fn compute_baseline_signature(metrics: &MetricsSnapshot) -> BaselineSignature {
    let mut dims = BTreeMap::new();
    if let Some(depth) = metrics.get("queue_depth").and_then(MetricValue::as_number) {
        let label = if depth <= 10.0 {
            "le_10"
        } else if depth <= 50.0 {
            "le_50"
        } else {
            "gt_50"
        };
        dims.insert("queue_depth".to_string(), label.to_string());
    }
    if let Some(size) = metrics.get("input_size").and_then(MetricValue::as_number) {
        let label = if size <= 1e3 {
            "le_1k"
        } else if size <= 1e5 {
            "le_100k"
        } else {
            "gt_100k"
        };
        dims.insert("input_size".to_string(), label.to_string());
    }
    for passthrough in ["mode", "time_window"] {
        if let Some(value) = metrics.get(passthrough).and_then(MetricValue::as_text) {
            dims.insert(passthrough.to_string(), value.to_string());
        }
    }
    BaselineSignature { dims }
}
