//! Content fingerprints.
//!
//! Step outputs are never persisted; a BLAKE3 fingerprint of the canonical
//! JSON encoding lets callers compare outputs across attempts without keeping
//! the payload around.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// BLAKE3 digest of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest raw bytes
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest the canonical JSON encoding of a value.
    ///
    /// Object keys are ordered by `serde_json::Map`, so equal values digest equally.
    #[must_use]
    pub fn of_json(value: &Value) -> Self {
        Self::of_bytes(value.to_string().as_bytes())
    }

    /// Lowercase hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
