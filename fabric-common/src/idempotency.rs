//! Idempotency keys and canonical payload hashing.
//!
//! Keys are deterministic SHA-256 digests over caller-supplied parts, so
//! the same logical request always lands on the same `(job_type, key)`
//! row. Payload hashes canonicalize JSON (deep key sort) before digesting
//! so two semantically equal payloads hash identically regardless of key
//! order. Digest comparison is constant-time.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Bounds on deterministic-key parts.
pub const MAX_KEY_PARTS: usize = 10;
pub const MAX_KEY_PART_LEN: usize = 1024;

/// Hashable payload bound, measured in serialized bytes (not chars).
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Hex digest length for the algorithm.
    fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Hex,
    Base64,
    Base64Url,
}

/// Derive a deterministic idempotency key from its parts.
///
/// Every part must be a non-empty string of at most [`MAX_KEY_PART_LEN`]
/// characters, and there must be between 1 and [`MAX_KEY_PARTS`] parts.
/// Equal inputs always produce the same 64-char hex output.
pub fn deterministic_key(parts: &[&str]) -> Result<String, Error> {
    if parts.is_empty() || parts.len() > MAX_KEY_PARTS {
        return Err(Error::Validation(format!(
            "idempotency key needs 1..={MAX_KEY_PARTS} parts, got {}",
            parts.len()
        )));
    }
    for part in parts {
        if part.is_empty() {
            return Err(Error::Validation("idempotency key part is empty".into()));
        }
        if part.chars().count() > MAX_KEY_PART_LEN {
            return Err(Error::Validation(format!(
                "idempotency key part exceeds {MAX_KEY_PART_LEN} chars"
            )));
        }
    }

    let joined = parts.join(":");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a JSON payload over its canonical (deep key-sorted) serialization.
///
/// JSON values are acyclic by construction in this codebase, so no cycle
/// placeholder is needed. Payloads whose canonical serialization exceeds
/// [`MAX_PAYLOAD_BYTES`] are rejected.
pub fn hash_payload(payload: &Value) -> Result<String, Error> {
    let canonical = canonicalize(payload);
    let bytes = serde_json::to_vec(&canonical)?;
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(Error::Validation(format!(
            "payload serializes to {} bytes, limit is {MAX_PAYLOAD_BYTES}",
            bytes.len()
        )));
    }

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Rebuild a value with every object's keys in sorted order. Insertion
/// order is controlled here, so the serialization is canonical even if a
/// preserve-order map implementation is in play.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, child) in entries {
                sorted.insert(key.clone(), canonicalize(child));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Constant-time equality over two hex digests. Time depends only on the
/// digest length, not on the position of the first mismatch.
pub fn payloads_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

static BASE64_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("static regex"));
static BASE64_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// Validate a key against its declared algorithm and encoding. Hex keys
/// must be exactly the digest length; base64 variants are checked for
/// character set only (their length depends on padding conventions).
pub fn is_valid_idempotency_key(key: &str, algorithm: HashAlgorithm, encoding: KeyEncoding) -> bool {
    match encoding {
        KeyEncoding::Hex => {
            key.len() == algorithm.hex_len() && key.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        }
        KeyEncoding::Base64 => !key.is_empty() && BASE64_RE.is_match(key),
        KeyEncoding::Base64Url => !key.is_empty() && BASE64_URL_RE.is_match(key),
    }
}
