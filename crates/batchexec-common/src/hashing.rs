// Cache key derivation: canonical JSON + SHA-256 + base64, per spec.md §3/§6
// ("cache key = base64(sha256(canonical-json(inputs)))[:16]"). Grounded on
// the teacher's `credential_data.rs` use of `sha2`/`base64` for content
// hashing, repurposed here as the Execution Cache's key function.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` with sorted map keys so semantically identical inputs
/// always produce the same bytes regardless of field insertion order
/// (spec.md §4.4 "Cache key derivation must be stable across runs").
pub fn canonical_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_value(v);
    Ok(serde_json::to_string(&sorted)?)
}

fn sort_value(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Length of the truncated cache key (spec.md §4.4: "`[:16]`").
const KEY_LEN: usize = 16;

/// Derive a cache key from any serializable input: `base64(sha256(json))`,
/// truncated to [`KEY_LEN`] characters.
pub fn cache_key<T: Serialize>(value: &T) -> anyhow::Result<String> {
    let json = canonical_json(value)?;
    Ok(cache_key_from_bytes(json.as_bytes()))
}

/// Same derivation, starting directly from raw bytes (used when the input is
/// already a canonical string, e.g. a diff or a rendered step command).
pub fn cache_key_from_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let encoded = base64_url(&digest);
    encoded.chars().take(KEY_LEN).collect()
}

/// URL-safe, unpadded base64 — avoids `/` and `+` so keys are usable as
/// filenames directly (spec.md §4.4 "entries are stored as `<key>.json`").
pub(crate) fn base64_url(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
