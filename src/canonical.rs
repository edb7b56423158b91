//! Canonical JSON serialization
//!
//! Object keys are emitted in sorted order at every depth, so two values that
//! differ only in key insertion order serialize identically. Array order is
//! significant. This is the single notion of equality used for permission
//! comparison, payload change detection and cache key digests.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize `value` with sorted object keys
///
/// Relies on serde_json's `preserve_order` feature staying off: objects are
/// then `BTreeMap`s and serialize in key order at every depth.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// Structural equality, independent of key insertion order
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    a == b
}

/// Short hex digest of the canonical form (first 8 bytes of SHA-256)
pub fn canonical_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}
