//! File watcher with debouncing for the sync folder.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Events are
//! reported as root-relative `/`-separated paths; ignore rules, suppression
//! and artifact filtering happen later in the replica.

use anyhow::Result;
use filesync_core::LocalEvent;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce window for rapid saves.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime per path, to drop spurious modify events
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// File watcher that monitors the sync root.
pub struct FileWatcher {
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl FileWatcher {
    pub fn new(root: PathBuf) -> Result<Self> {
        // FSEvents on macOS needs the resolved path (/var -> /private/var)
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(local) = Self::process_event(&event, &root_clone, &mtime_cache) {
                            if event_tx.send(local).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(event: &DebouncedEvent, root: &Path, mtime_cache: &MtimeCache) -> Option<LocalEvent> {
        let path = &event.path;
        let relative = path.strip_prefix(root).ok()?;
        let relative_str = relative_path_string(relative)?;

        // Debounced events carry no create/delete distinction
        let local = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => return None,
            Ok(metadata) => {
                let mtime = metadata.modified().ok();
                let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(mtime) = mtime {
                    if cache.get(relative) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(relative.to_path_buf(), mtime);
                }
                LocalEvent::Modified(relative_str)
            }
            Err(_) => {
                mtime_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(relative);
                LocalEvent::Deleted(relative_str)
            }
        };

        debug!("File event: {:?}", local);
        Some(local)
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Root-relative path with `/` separators, or `None` for the root itself or a
/// non-UTF-8 name.
fn relative_path_string(relative: &Path) -> Option<String> {
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
