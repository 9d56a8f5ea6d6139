//! Echo suppression for writes we perform ourselves.
//!
//! When a change arrives from the network, the path is marked here BEFORE the
//! file is written or deleted. When the file watcher later reports that path,
//! the lookup succeeds and the event is dropped instead of being announced
//! back to the network.
//!
//! Entries expire after a fixed TTL so a dropped watcher event cannot
//! suppress a real local edit forever. Expired entries are evicted lazily on
//! lookup; there is no background sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use web_time::Instant;

/// Default time-to-live for a suppression entry.
pub const DEFAULT_SUPPRESS_TTL: Duration = Duration::from_secs(2);

/// Expiring deny-list keyed by relative path.
///
/// Cloning shares the underlying entries, so a watcher thread and the sync
/// engine can hold the same ledger.
#[derive(Clone)]
pub struct SuppressionLedger {
    /// Map of path -> instant the entry stops suppressing
    entries: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl Default for SuppressionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPRESS_TTL)
    }
}

impl SuppressionLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Mark a path as about to be written by us (call before touching disk).
    pub fn mark(&self, path: &str) {
        self.mark_at(path, Instant::now());
    }

    /// Check whether a watcher event for `path` was caused by our own write.
    pub fn is_suppressed(&self, path: &str) -> bool {
        self.is_suppressed_at(path, Instant::now())
    }

    pub fn mark_at(&self, path: &str, now: Instant) {
        self.lock().insert(path.to_string(), now + self.ttl);
    }

    /// Lookup against an explicit clock. An entry found expired is removed.
    pub fn is_suppressed_at(&self, path: &str, now: Instant) -> bool {
        let mut entries = self.lock();
        match entries.get(path) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                entries.remove(path);
                false
            }
            None => false,
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        // A panic while holding the lock leaves the map in a valid state.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
