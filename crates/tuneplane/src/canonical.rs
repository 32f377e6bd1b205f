//! Canonical JSON serialization and content hashing.
//!
//! Every hash in the crate goes through this module: values are rendered
//! as canonical JSON (object keys recursively sorted, compact separators,
//! no trailing whitespace) and hashed with SHA-256 under a per-artifact
//! domain-separation prefix. Hashes are therefore stable across platforms
//! and across serde field-ordering changes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Domain prefix for ledger entries.
pub const DOMAIN_LEDGER: &str = "tuneplane.ledger.v1";
/// Domain prefix for tuning IRs.
pub const DOMAIN_IR: &str = "tuneplane.ir.v1";
/// Domain prefix for rollback IRs.
pub const DOMAIN_ROLLBACK: &str = "tuneplane.rollback.v1";
/// Domain prefix for effect-store snapshot files.
pub const DOMAIN_EFFECT_STORE: &str = "tuneplane.effect-store.v1";
/// Domain prefix for metrics snapshots referenced by rollback evidence.
pub const DOMAIN_METRICS: &str = "tuneplane.metrics.v1";
/// Domain prefix for promotion proposals.
pub const DOMAIN_PROPOSAL: &str = "tuneplane.proposal.v1";
/// Domain prefix for per-cycle decision bundles.
pub const DOMAIN_BUNDLE: &str = "tuneplane.bundle.v1";

/// Render a JSON value canonically: object keys sorted at every level,
/// compact separators.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json's string serialization handles all escaping.
            out.push_str(&serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string()));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Serialize a value and render it canonically.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    Ok(canonical_json(&v))
}

/// SHA-256 of `payload` under a domain-separation prefix, hex-encoded.
pub fn hash_with_domain(domain: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content hash of a serializable value: canonical JSON, then domain-prefixed
/// SHA-256.
pub fn content_hash<T: Serialize>(domain: &str, value: &T) -> Result<String, serde_json::Error> {
    Ok(hash_with_domain(domain, &canonical_string(value)?))
}
