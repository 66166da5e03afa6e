//! Hashing System - SHA-256 for Generated Documents
//!
//! Deterministic hashes so a document can be traced back to the exact
//! template version and resolved values that produced it.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_value(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Hash of the rendered document text.
pub fn compute_content_hash(rendered: &str) -> String {
    sha256_hex(rendered.as_bytes())
}

/// job_hash = sha256(template_id : template_version : output_format : canonical_values : engine_version)
///
/// Two generations with the same job hash rendered the same inputs.
pub fn compute_job_hash(
    template_id: &str,
    template_version: u32,
    output_format: &str,
    values: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_values = canonical_json(values)?;
    let combined = format!(
        "{}:{}:{}:{}:{}",
        template_id, template_version, output_format, canonical_values, engine_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
