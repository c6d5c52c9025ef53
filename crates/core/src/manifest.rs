//! Sync manifests: the chunk list and permutation two peers agree on
//! before transferring a file.

use crate::hash::ChunkKey;
use crate::shuffle::Permutation;
use crate::wire;
use crate::MAX_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Metadata for one chunk of a manifest: its key and its size in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    #[serde(rename = "Key")]
    pub key: ChunkKey,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl ChunkInfo {
    pub fn new(key: ChunkKey, size: u64) -> Self {
        Self { key, size }
    }
}

/// A manifest describing one file for a sync session: the ordered list of
/// `(key, size)` pairs in file order, plus the permutation under which the
/// wishlist and the chunk bodies will be interleaved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Chunks")]
    pub chunks: Vec<ChunkInfo>,
    #[serde(rename = "Perm")]
    pub perm: Permutation,
}

impl Manifest {
    /// Create an empty manifest with the trivial permutation.
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            perm: Permutation::trivial(),
        }
    }

    /// Replace the session permutation.
    pub fn set_permutation(&mut self, perm: Permutation) {
        self.perm = perm;
    }

    /// Reset the permutation to the trivial one (no reordering).
    pub fn set_trivial_permutation(&mut self) {
        self.perm = Permutation::trivial();
    }

    /// Append one chunk.
    pub fn add_chunk(&mut self, key: ChunkKey, size: u64) {
        self.chunks.push(ChunkInfo::new(key, size));
    }

    /// Replace the chunk list.
    pub fn set_chunks<I: IntoIterator<Item = ChunkInfo>>(&mut self, chunks: I) {
        self.chunks = chunks.into_iter().collect();
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total size in bytes of the described file.
    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON, validating chunk sizes.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| crate::Error::Serialization(e.to_string()))?;
        manifest.check_sizes()?;
        Ok(manifest)
    }

    /// Read the legacy binary manifest stream: `32-byte key || varint(size)`
    /// records until EOF. The legacy format carries no permutation, so the
    /// trivial permutation is implied.
    pub fn read_legacy_stream<R: Read>(mut r: R) -> crate::Result<Self> {
        let mut manifest = Manifest::new();
        loop {
            let mut key = [0u8; 32];
            match r.read_exact(&mut key[..1]) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            r.read_exact(&mut key[1..])?;
            let size = wire::read_varint(&mut r)?;
            if size <= 0 || size as u64 > MAX_CHUNK_SIZE {
                return Err(crate::Error::InvalidChunkLength(size));
            }
            manifest.add_chunk(ChunkKey::from_bytes(key), size as u64);
        }
        Ok(manifest)
    }

    /// Write the legacy binary manifest stream.
    pub fn write_legacy_stream<W: Write>(&self, mut w: W) -> crate::Result<()> {
        for info in &self.chunks {
            w.write_all(info.key.as_bytes())?;
            wire::write_varint(&mut w, info.size as i64)?;
        }
        Ok(())
    }

    fn check_sizes(&self) -> crate::Result<()> {
        for info in &self.chunks {
            if info.size == 0 || info.size > MAX_CHUNK_SIZE {
                return Err(crate::Error::InvalidChunkLength(info.size as i64));
            }
        }
        Ok(())
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.add_chunk(ChunkKey::compute(b"first"), 1337);
        manifest.add_chunk(ChunkKey::compute(b"second"), 42);
        manifest.add_chunk(ChunkKey::compute(b"first"), 1337);
        manifest.set_permutation(Permutation::from_vec(vec![2, 0, 1]).unwrap());
        manifest
    }

    #[test]
    fn test_json_roundtrip() {
        let manifest = sample_manifest();
        let json = manifest.to_json().unwrap();
        let back = Manifest::from_json(&json).unwrap();
        assert_eq!(back.chunks, manifest.chunks);
        assert_eq!(back.perm, manifest.perm);
        assert_eq!(manifest.to_json().unwrap(), back.to_json().unwrap());
    }

    #[test]
    fn test_json_field_names() {
        let manifest = sample_manifest();
        let value: serde_json::Value =
            serde_json::from_str(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["Perm"], serde_json::json!([2, 0, 1]));
        assert_eq!(value["Chunks"][0]["Size"], serde_json::json!(1337));
        let key = value["Chunks"][0]["Key"].as_str().unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, ChunkKey::compute(b"first").to_hex());
    }

    #[test]
    fn test_from_json_rejects_bad_sizes() {
        let key = ChunkKey::compute(b"x").to_hex();
        let json = format!(r#"{{"Chunks":[{{"Key":"{key}","Size":0}}],"Perm":[0]}}"#);
        assert!(Manifest::from_json(&json).is_err());
        let json = format!(
            r#"{{"Chunks":[{{"Key":"{key}","Size":{}}}],"Perm":[0]}}"#,
            MAX_CHUNK_SIZE + 1
        );
        assert!(Manifest::from_json(&json).is_err());
    }

    #[test]
    fn test_legacy_stream_roundtrip() {
        let manifest = sample_manifest();
        let mut encoded = Vec::new();
        manifest.write_legacy_stream(&mut encoded).unwrap();
        assert_eq!(encoded.len(), 3 * 32 + 2 + 1 + 2);

        let back = Manifest::read_legacy_stream(&encoded[..]).unwrap();
        assert_eq!(back.chunks, manifest.chunks);
        // The legacy format implies the trivial permutation.
        assert_eq!(back.perm, Permutation::trivial());
    }

    #[test]
    fn test_legacy_stream_truncated_key() {
        let manifest = sample_manifest();
        let mut encoded = Vec::new();
        manifest.write_legacy_stream(&mut encoded).unwrap();
        encoded.truncate(40);
        assert!(Manifest::read_legacy_stream(&encoded[..]).is_err());
    }

    #[test]
    fn test_total_size() {
        assert_eq!(sample_manifest().total_size(), 1337 + 42 + 1337);
        assert_eq!(Manifest::new().total_size(), 0);
    }
}
