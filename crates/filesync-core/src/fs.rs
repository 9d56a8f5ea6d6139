//! FileSystem trait abstraction for platform-independent file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in filesync-daemon) - Uses tokio::fs
//!
//! All paths are relative to the filesystem's root and use `/` separators.
//! The empty path names the root itself.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Delete a file or a whole directory tree.
    ///
    /// Removing the root (`""`) empties it and leaves the root itself in place.
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Current wall-clock time in milliseconds since epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, (Vec<u8>, u64)>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// Number of files currently stored (directories excluded).
    pub fn file_count(&self) -> usize {
        self.files.read().unwrap().len()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        if path.is_empty() {
            None
        } else {
            match path.rfind('/') {
                Some(pos) => Some(path[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn is_under(candidate: &str, path: &str) -> bool {
        path.is_empty()
            || candidate == path
            || candidate
                .strip_prefix(path)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        match files.get(&path) {
            Some((content, _)) => Ok(content.clone()),
            None if self.dirs.read().unwrap().contains(&path) => Err(FsError::IsDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        let mut files = self.files.write().unwrap();
        files.insert(path, (content.to_vec(), now_millis()));
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let direct_child = |candidate: &str| -> Option<String> {
            let rest = candidate.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut entries: Vec<FileEntry> = dirs
            .iter()
            .filter_map(|d| direct_child(d.as_str()))
            .map(|name| FileEntry { name, is_dir: true })
            .collect();

        let files = self.files.read().unwrap();
        entries.extend(
            files
                .keys()
                .filter_map(|f| direct_child(f.as_str()))
                .map(|name| FileEntry {
                    name,
                    is_dir: false,
                }),
        );

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if self.files.write().unwrap().remove(&path).is_some() {
            return Ok(());
        }

        let mut dirs = self.dirs.write().unwrap();
        if !path.is_empty() && dirs.contains(&path) {
            let has_children = dirs.iter().any(|d| d != &path && Self::is_under(d, &path))
                || self
                    .files
                    .read()
                    .unwrap()
                    .keys()
                    .any(|f| Self::is_under(f, &path));
            if has_children {
                return Err(FsError::Io(format!("Directory not empty: {}", path)));
            }
            dirs.remove(&path);
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if !self.exists(&path).await? {
            return Err(FsError::NotFound(path));
        }

        self.files
            .write()
            .unwrap()
            .retain(|f, _| !Self::is_under(f, &path));
        self.dirs
            .write()
            .unwrap()
            .retain(|d| d.is_empty() || !Self::is_under(d, &path));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some((content, mtime)) = self.files.read().unwrap().get(&path) {
            return Ok(FileStat {
                mtime_millis: *mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap().contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }
        if self.files.read().unwrap().contains_key(&path) {
            return Err(FsError::Io(format!("Not a directory: {}", path)));
        }

        // Create parent first
        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs.write().unwrap().insert(path);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows a test to keep a handle on the filesystem it gave to an engine
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        (**self).remove_all(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
