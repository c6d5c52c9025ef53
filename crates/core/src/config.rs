//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};

/// Chunk store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of bytes the store may hold.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Sync session configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Memo-queue capacity between the wishlist and reconstruction tasks.
    /// Small values stall the pipeline, large values hold more chunk
    /// handles in flight.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Shuffle permutation length for outgoing transfers.
    #[serde(default = "default_permutation_len")]
    pub permutation_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            permutation_len: default_permutation_len(),
        }
    }
}

fn default_capacity() -> u64 {
    256 * 1024 * 1024
}

fn default_window_size() -> usize {
    32
}

fn default_permutation_len() -> usize {
    1024
}
