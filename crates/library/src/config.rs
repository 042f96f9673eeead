use serde::{Deserialize, Serialize};

pub const DEFAULT_DELETE_CHUNK_SIZE: usize = 999;

/// Tunables for one scanner. Missing fields fall back to their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Upper bound on ids removed per cleanup transaction.
    pub delete_chunk_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE,
        }
    }
}

impl ScanConfig {
    pub fn delete_chunk_size(&self) -> usize {
        self.delete_chunk_size.max(1)
    }
}
