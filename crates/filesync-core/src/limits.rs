//! Size ceilings shared by both roles.

use serde::Deserialize;

/// Largest file content that is read, sent or written.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Largest inbound frame that is parsed.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_file_size: u64,
    pub max_payload_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl Limits {
    pub fn file_fits(&self, size: u64) -> bool {
        size <= self.max_file_size
    }
}
