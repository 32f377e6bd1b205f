//! Declared knob specifications and typed knob values.
//!
//! A [`TuningEnvelope`] declares, per module, each knob's kind, bounds or
//! enum domain, default, whether it is hot-appliable, required capability,
//! and stabilization requirement. Envelopes are immutable once loaded for
//! a cycle; assignment validation rejects the specific offending unit with
//! a machine-readable reason and never raises.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// KnobKind / KnobValue
// ---------------------------------------------------------------------------

/// The declared type of a knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobKind {
    Int,
    Float,
    Bool,
    Enum,
    DurationMs,
}

impl KnobKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Enum => "enum",
            Self::DurationMs => "duration_ms",
        }
    }
}

impl fmt::Display for KnobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A typed knob value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KnobValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
    DurationMs(u64),
}

impl KnobValue {
    #[must_use]
    pub fn kind(&self) -> KnobKind {
        match self {
            Self::Int(_) => KnobKind::Int,
            Self::Float(_) => KnobKind::Float,
            Self::Bool(_) => KnobKind::Bool,
            Self::Enum(_) => KnobKind::Enum,
            Self::DurationMs(_) => KnobKind::DurationMs,
        }
    }

    /// Stable string form used in store keys and tie-breaking.
    #[must_use]
    pub fn key_string(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Enum(v) => v.clone(),
            Self::DurationMs(v) => v.to_string(),
        }
    }

    /// Numeric view for bounded kinds.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::DurationMs(v) => Some(*v as f64),
            Self::Bool(_) | Self::Enum(_) => None,
        }
    }
}

impl fmt::Display for KnobValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_string())
    }
}

// ---------------------------------------------------------------------------
// KnobSpec
// ---------------------------------------------------------------------------

/// Declared specification of one tunable knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobSpec {
    pub name: String,
    pub kind: KnobKind,
    /// Lower bound for numeric kinds.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound for numeric kinds.
    #[serde(default)]
    pub max: Option<f64>,
    /// Enum domain; empty for non-enum kinds.
    #[serde(default)]
    pub domain: Vec<String>,
    pub default: KnobValue,
    /// Whether the knob can be changed on a live module.
    pub hot_apply: bool,
    /// Capability required to change this knob, if any.
    #[serde(default)]
    pub required_capability: Option<String>,
    /// Cycles a module must be stable before this knob may change again.
    #[serde(default)]
    pub stabilization_cycles: u64,
}

impl KnobSpec {
    /// Candidate values for learning: the enum domain, `{false, true}`, or
    /// `{min, default, max}` for numeric kinds. Deduplicated and sorted by
    /// value string so traversal is deterministic.
    #[must_use]
    pub fn candidates(&self) -> Vec<KnobValue> {
        let mut values: Vec<KnobValue> = match self.kind {
            KnobKind::Bool => vec![KnobValue::Bool(false), KnobValue::Bool(true)],
            KnobKind::Enum => self
                .domain
                .iter()
                .map(|v| KnobValue::Enum(v.clone()))
                .collect(),
            KnobKind::Int => {
                let mut out = vec![self.default.clone()];
                if let Some(min) = self.min {
                    out.push(KnobValue::Int(min as i64));
                }
                if let Some(max) = self.max {
                    out.push(KnobValue::Int(max as i64));
                }
                out
            }
            KnobKind::Float => {
                let mut out = vec![self.default.clone()];
                if let Some(min) = self.min {
                    out.push(KnobValue::Float(min));
                }
                if let Some(max) = self.max {
                    out.push(KnobValue::Float(max));
                }
                out
            }
            KnobKind::DurationMs => {
                let mut out = vec![self.default.clone()];
                if let Some(min) = self.min {
                    out.push(KnobValue::DurationMs(min.max(0.0) as u64));
                }
                if let Some(max) = self.max {
                    out.push(KnobValue::DurationMs(max.max(0.0) as u64));
                }
                out
            }
        };
        values.sort_by(|a, b| a.key_string().cmp(&b.key_string()));
        values.dedup_by_key(|v| v.key_string());
        values
    }

    /// Validate a value against this spec.
    pub fn validate(&self, value: &KnobValue) -> Result<(), AssignmentError> {
        if value.kind() != self.kind {
            return Err(AssignmentError::KindMismatch {
                knob: self.name.clone(),
                expected: self.kind,
                actual: value.kind(),
            });
        }
        match value {
            KnobValue::Enum(v) => {
                if !self.domain.iter().any(|d| d == v) {
                    return Err(AssignmentError::NotInDomain {
                        knob: self.name.clone(),
                        value: v.clone(),
                    });
                }
            }
            KnobValue::Bool(_) => {}
            _ => {
                let numeric = value.as_f64().unwrap_or(0.0);
                if let Some(min) = self.min {
                    if numeric < min {
                        return Err(AssignmentError::OutOfBounds {
                            knob: self.name.clone(),
                            value: value.key_string(),
                        });
                    }
                }
                if let Some(max) = self.max {
                    if numeric > max {
                        return Err(AssignmentError::OutOfBounds {
                            knob: self.name.clone(),
                            value: value.key_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AssignmentError
// ---------------------------------------------------------------------------

/// Structural validation failures for a single assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentError {
    UnknownKnob { knob: String },
    KindMismatch {
        knob: String,
        expected: KnobKind,
        actual: KnobKind,
    },
    OutOfBounds { knob: String, value: String },
    NotInDomain { knob: String, value: String },
}

impl AssignmentError {
    /// Machine-readable reason string.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::UnknownKnob { knob } => format!("unknown_knob:{knob}"),
            Self::KindMismatch {
                knob,
                expected,
                actual,
            } => format!("kind_mismatch:{knob}:{expected}!={actual}"),
            Self::OutOfBounds { knob, value } => format!("out_of_bounds:{knob}:{value}"),
            Self::NotInDomain { knob, value } => format!("not_in_domain:{knob}:{value}"),
        }
    }
}

impl fmt::Display for AssignmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

impl std::error::Error for AssignmentError {}

// ---------------------------------------------------------------------------
// TuningEnvelope
// ---------------------------------------------------------------------------

/// Per-module knob declarations, immutable once loaded for a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningEnvelope {
    pub module_id: String,
    pub knobs: BTreeMap<String, KnobSpec>,
}

impl TuningEnvelope {
    #[must_use]
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            knobs: BTreeMap::new(),
        }
    }

    /// Add a knob spec, keyed by its name.
    #[must_use]
    pub fn with_knob(mut self, spec: KnobSpec) -> Self {
        self.knobs.insert(spec.name.clone(), spec);
        self
    }

    #[must_use]
    pub fn knob(&self, name: &str) -> Option<&KnobSpec> {
        self.knobs.get(name)
    }

    /// Validate one assignment against the envelope.
    pub fn validate_assignment(
        &self,
        knob: &str,
        value: &KnobValue,
    ) -> Result<(), AssignmentError> {
        let spec = self.knobs.get(knob).ok_or(AssignmentError::UnknownKnob {
            knob: knob.to_string(),
        })?;
        spec.validate(value)
    }
}
