//! In-memory record of the files a process has synced.
//!
//! Nothing here is persisted: a restart, or a folder clear, starts every path
//! over at version 1.

use crate::fs::now_millis;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Last known state of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedFile {
    pub relative_path: String,
    pub content: String,
    /// Milliseconds since epoch of the accepted write
    pub last_modified: u64,
    /// Peer that produced the content
    pub origin_id: String,
    /// Starts at 1, bumped on every accepted change
    pub version: u64,
}

#[derive(Debug, Default)]
pub struct FileIndex {
    files: HashMap<String, SyncedFile>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted write and return the updated entry.
    pub fn record(&mut self, path: &str, content: String, origin_id: &str) -> &SyncedFile {
        let now = now_millis();
        match self.files.entry(path.to_string()) {
            Entry::Occupied(occupied) => {
                let file = occupied.into_mut();
                file.content = content;
                file.last_modified = now;
                file.origin_id = origin_id.to_string();
                file.version += 1;
                file
            }
            Entry::Vacant(vacant) => vacant.insert(SyncedFile {
                relative_path: path.to_string(),
                content,
                last_modified: now,
                origin_id: origin_id.to_string(),
                version: 1,
            }),
        }
    }

    pub fn get(&self, path: &str) -> Option<&SyncedFile> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<SyncedFile> {
        self.files.remove(path)
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}
