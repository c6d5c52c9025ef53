//! Chunk keys and hashing.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A chunk key: the SHA-256 digest of a chunk's bytes, represented as 32
/// raw bytes. Equality of keys identifies content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey([u8; 32]);

impl ChunkKey {
    /// The all-zero key, reserved as a sentinel. Never a valid content key.
    pub const ZERO: ChunkKey = ChunkKey([0u8; 32]);

    /// Create a ChunkKey from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the SHA-256 key of a chunk's data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ChunkHasher {
        ChunkHasher(Sha256::new())
    }

    /// Check whether this is the reserved all-zero sentinel key.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a 64-character lowercase hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidKey(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidKey(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidKey(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Keys travel as hex strings in serialized manifests, raw bytes elsewhere.
impl Serialize for ChunkKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChunkKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 chunk hasher.
pub struct ChunkHasher(Sha256);

impl ChunkHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the key.
    pub fn finalize(self) -> ChunkKey {
        ChunkKey(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hex_roundtrip() {
        let key = ChunkKey::compute(b"hello world");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        let parsed = ChunkKey::from_hex(&hex).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_key_matches_incremental_hasher() {
        let mut hasher = ChunkKey::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), ChunkKey::compute(b"hello world"));
    }

    #[test]
    fn test_zero_key() {
        assert!(ChunkKey::ZERO.is_zero());
        assert!(!ChunkKey::compute(b"").is_zero());
    }

    #[test]
    fn test_key_json_is_hex_string() {
        let key = ChunkKey::compute(b"data");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: ChunkKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ChunkKey::from_hex("abc").is_err());
        assert!(ChunkKey::from_hex(&"zz".repeat(32)).is_err());
    }
}
