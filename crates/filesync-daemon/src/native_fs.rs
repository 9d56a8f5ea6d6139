//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use filesync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Filesystem rooted at the sync folder.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_err(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::IsADirectory => FsError::IsDirectory(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            // file_type does not follow symlinks; a vanished entry is skipped
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        result.map_err(|e| map_err(path, e))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        if !metadata.is_dir() {
            return fs::remove_file(&full_path)
                .await
                .map_err(|e| map_err(path, e));
        }
        if !path.is_empty() {
            return fs::remove_dir_all(&full_path)
                .await
                .map_err(|e| map_err(path, e));
        }

        // Root: empty it but keep the directory itself
        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let child = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&child).await
            } else {
                fs::remove_file(&child).await
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(map_err(&child.to_string_lossy(), e)),
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }
}
