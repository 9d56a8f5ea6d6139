//! Local copy of the synced folder, as seen by one process.
//!
//! `Replica` owns the filesystem handle, the file index, the suppression
//! ledger and the ignore-rule cache. Both engines go through it for every
//! disk effect, so the mark-before-write discipline lives in one place:
//! every write or delete caused by the network marks the path in the ledger
//! first, and [`Replica::observe`] drops watcher events for marked paths.

use crate::error::{Result, SyncError};
use crate::fs::{FileSystem, FsError};
use crate::ignore::{DEFAULT_CACHE_TTL, IgnoreCache, IgnoreRules, join};
use crate::index::{FileIndex, SyncedFile};
use crate::limits::Limits;
use crate::logging::Logger;
use crate::scanner;
use crate::suppression::{DEFAULT_SUPPRESS_TTL, SuppressionLedger};
use std::time::Duration;

/// Raw change reported by a filesystem watcher, as a root-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// Created or modified
    Modified(String),
    Deleted(String),
}

impl LocalEvent {
    pub fn path(&self) -> &str {
        match self {
            LocalEvent::Modified(path) | LocalEvent::Deleted(path) => path,
        }
    }
}

/// A local change that should be announced to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIntent {
    Created {
        path: String,
        content: String,
        version: u64,
    },
    Changed {
        path: String,
        content: String,
        version: u64,
    },
    Deleted {
        path: String,
    },
}

impl LocalIntent {
    pub fn path(&self) -> &str {
        match self {
            LocalIntent::Created { path, .. }
            | LocalIntent::Changed { path, .. }
            | LocalIntent::Deleted { path } => path,
        }
    }
}

/// Result of applying a remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub version: u64,
    /// The index had no entry for the path
    pub created: bool,
    /// Overwrote local content that differs from the incoming version
    pub conflict: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Origin recorded for changes observed on this replica's own disk
    pub origin_id: String,
    pub limits: Limits,
    pub suppress_ttl: Duration,
    pub ignore_cache_ttl: Duration,
    pub sync_git_folder: bool,
}

impl ReplicaConfig {
    pub fn new(origin_id: impl Into<String>) -> Self {
        Self {
            origin_id: origin_id.into(),
            limits: Limits::default(),
            suppress_ttl: DEFAULT_SUPPRESS_TTL,
            ignore_cache_ttl: DEFAULT_CACHE_TTL,
            sync_git_folder: false,
        }
    }
}

pub struct Replica<F> {
    fs: F,
    index: FileIndex,
    ledger: SuppressionLedger,
    ignore: IgnoreCache,
    limits: Limits,
    origin_id: String,
    conflicts: u64,
    log: Logger,
}

impl<F: FileSystem> Replica<F> {
    pub fn new(fs: F, config: ReplicaConfig, log: Logger) -> Self {
        Self {
            fs,
            index: FileIndex::new(),
            ledger: SuppressionLedger::new(config.suppress_ttl),
            ignore: IgnoreCache::new(config.ignore_cache_ttl, config.sync_git_folder),
            limits: config.limits,
            origin_id: config.origin_id,
            conflicts: 0,
            log,
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    /// Shared handle to the suppression ledger.
    pub fn ledger(&self) -> &SuppressionLedger {
        &self.ledger
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Number of conflicting overwrites seen so far.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts
    }

    pub async fn ignore_rules(&mut self) -> &IgnoreRules {
        self.ignore.rules(&self.fs, &self.log).await
    }

    /// Syncable paths currently on disk.
    pub async fn scan(&mut self) -> Vec<String> {
        let rules = self.ignore.rules(&self.fs, &self.log).await;
        scanner::scan(&self.fs, rules, self.log).await
    }

    /// Read a file for sending, enforcing the size ceiling.
    pub async fn read_text(&self, path: &str) -> Result<String> {
        let stat = self.fs.stat(path).await?;
        if !self.limits.file_fits(stat.size) {
            return Err(SyncError::FileTooLarge {
                path: path.to_string(),
                size: stat.size,
                limit: self.limits.max_file_size,
            });
        }
        let bytes = self.fs.read(path).await?;
        String::from_utf8(bytes).map_err(|_| SyncError::NotText(path.to_string()))
    }

    /// Record content sent from this replica (initial sync).
    pub fn record_sent(&mut self, path: &str, content: &str) -> &SyncedFile {
        self.index
            .record(path, content.to_string(), &self.origin_id)
    }

    /// Turn a watcher event into an intent, or drop it.
    pub async fn observe(&mut self, event: LocalEvent) -> Option<LocalIntent> {
        let path = event.path().replace('\\', "/");

        if self.ledger.is_suppressed(&path) {
            self.log
                .debug(format!("Suppressed own write event: {}", path));
            return None;
        }
        if self.ignore_rules().await.should_ignore(&path) {
            self.log.debug(format!("Ignored path: {}", path));
            return None;
        }
        if is_transient_artifact(&path) {
            self.log
                .debug(format!("Skipping editor artifact: {}", path));
            return None;
        }

        match event {
            LocalEvent::Deleted(_) => {
                // Directories and files never synced have no index entry
                if self.index.remove(&path).is_none() {
                    self.log
                        .debug(format!("Delete of untracked path: {}", path));
                    return None;
                }
                Some(LocalIntent::Deleted { path })
            }
            LocalEvent::Modified(_) => self.observe_modified(path).await,
        }
    }

    async fn observe_modified(&mut self, path: String) -> Option<LocalIntent> {
        let content = match self.read_text(&path).await {
            Ok(content) => content,
            Err(SyncError::Fs(FsError::NotFound(_))) => {
                // Removed again before we got to it; the delete event follows
                return None;
            }
            Err(e @ SyncError::FileTooLarge { .. }) => {
                self.log.warn(format!("Skipping: {}", e));
                return None;
            }
            Err(e) => {
                self.log
                    .warn(format!("Failed to read {}: {}", path, e));
                return None;
            }
        };

        let created = match self.index.get(&path) {
            Some(known) if known.content == content => {
                self.log.debug(format!("Content unchanged: {}", path));
                return None;
            }
            Some(_) => false,
            None => true,
        };

        let version = self
            .index
            .record(&path, content.clone(), &self.origin_id)
            .version;
        Some(if created {
            LocalIntent::Created {
                path,
                content,
                version,
            }
        } else {
            LocalIntent::Changed {
                path,
                content,
                version,
            }
        })
    }

    /// Write content that arrived from `origin`.
    ///
    /// Last writer wins: a conflict is logged and counted, never refused.
    pub async fn apply_write(&mut self, path: &str, content: &str, origin: &str) -> Result<WriteOutcome> {
        let size = content.len() as u64;
        if !self.limits.file_fits(size) {
            return Err(SyncError::FileTooLarge {
                path: path.to_string(),
                size,
                limit: self.limits.max_file_size,
            });
        }

        let conflict = self.is_conflict(path, content, origin).await;

        self.ledger.mark(path);
        self.fs.write(path, content.as_bytes()).await?;

        let created = !self.index.contains(path);
        let version = self.index.record(path, content.to_string(), origin).version;
        if conflict {
            self.conflicts += 1;
            self.log.warn(format!(
                "Conflict on {}: local content differs, incoming version from {} wins",
                path, origin
            ));
        }

        Ok(WriteOutcome {
            version,
            created,
            conflict,
        })
    }

    /// The file on disk differs from `incoming`, and is not simply the
    /// previous version from the same origin.
    async fn is_conflict(&self, path: &str, incoming: &str, origin: &str) -> bool {
        let Ok(current) = self.fs.read(path).await else {
            return false;
        };
        if current == incoming.as_bytes() {
            return false;
        }
        match self.index.get(path) {
            Some(known) => known.origin_id != origin || current != known.content.as_bytes(),
            // Untracked local file
            None => true,
        }
    }

    /// Delete a file because of a remote change. Returns whether it existed.
    pub async fn apply_delete(&mut self, path: &str) -> Result<bool> {
        self.ledger.mark(path);
        self.index.remove(path);
        match self.fs.delete(path).await {
            Ok(()) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Empty the root and forget every indexed file.
    pub async fn clear(&mut self) -> Result<()> {
        for path in self.all_entries().await {
            self.ledger.mark(&path);
        }
        for path in self.index.paths() {
            self.ledger.mark(path);
        }

        self.fs.remove_all("").await?;
        self.fs.mkdir("").await?;
        self.index.clear();
        Ok(())
    }

    /// Every file and directory under the root, ignore rules not applied.
    async fn all_entries(&self) -> Vec<String> {
        let mut entries_seen = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let entries = match self.fs.list(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.log.debug(format!("Failed to list {:?}: {}", dir, e));
                    continue;
                }
            };
            for entry in entries {
                let path = join(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(path.clone());
                }
                entries_seen.push(path);
            }
        }
        entries_seen
    }
}

/// Editor swap files, backups and lock files.
pub fn is_transient_artifact(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    path.starts_with('.') || name.starts_with('.') || path.contains(['~', '#'])
}
