//! Initial-sync file discovery.

use crate::fs::FileSystem;
use crate::ignore::{IgnoreRules, join};
use crate::logging::Logger;
use std::collections::VecDeque;

/// Extensions that are never synced.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp", "ico", "pdf", "doc", "docx", "xls",
    "xlsx", "ppt", "pptx", "zip", "rar", "7z", "tar", "gz", "bz2", "xz", "exe", "dll", "so",
    "dylib", "a", "lib", "o", "obj", "class", "jar", "war", "ear", "apk", "ipa", "deb", "rpm",
    "msi", "pkg", "dmg", "iso", "bin", "dat", "db", "sqlite", "sqlite3", "wasm", "woff",
    "woff2", "ttf", "otf", "mp3", "mp4", "wav", "mov",
];

/// Whether a file name looks like text. Unknown and missing extensions count
/// as text.
pub fn is_text_file(name: &str) -> bool {
    let name = name.rsplit('/').next().unwrap_or(name);
    match name.rsplit_once('.') {
        // ".env", ".gitignore": a leading dot is not an extension
        Some(("", _)) | None => true,
        Some((_, ext)) => !BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
    }
}

/// Single pass over the files under the root.
///
/// Yields root-relative paths in depth-first order. Directories are listed
/// as they are reached, so the result reflects disk state during the walk.
pub struct Scan<'a, F: ?Sized> {
    fs: &'a F,
    rules: &'a IgnoreRules,
    log: Logger,
    dirs: Vec<String>,
    ready: VecDeque<String>,
}

impl<'a, F> Scan<'a, F>
where
    F: FileSystem + ?Sized,
{
    pub fn new(fs: &'a F, rules: &'a IgnoreRules, log: Logger) -> Self {
        Self {
            fs,
            rules,
            log,
            dirs: vec![String::new()],
            ready: VecDeque::new(),
        }
    }

    /// Next syncable path, or `None` once the walk is exhausted.
    pub async fn next(&mut self) -> Option<String> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Some(path);
            }
            let dir = self.dirs.pop()?;
            self.expand(&dir).await;
        }
    }

    /// Drain the remaining paths.
    pub async fn collect(mut self) -> Vec<String> {
        let mut paths = Vec::new();
        while let Some(path) = self.next().await {
            paths.push(path);
        }
        paths
    }

    async fn expand(&mut self, dir: &str) {
        let mut entries = match self.fs.list(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                self.log
                    .warn(format!("Error scanning directory {:?}: {}", dir, e));
                return;
            }
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut subdirs = Vec::new();
        for entry in entries {
            let path = join(dir, &entry.name);
            if entry.is_dir {
                if self.rules.should_ignore(&format!("{path}/")) {
                    self.log.debug(format!("Skipping ignored directory {}", path));
                } else {
                    subdirs.push(path);
                }
            } else if self.rules.should_ignore(&path) {
                self.log.debug(format!("Skipping ignored file {}", path));
            } else if !is_text_file(&entry.name) {
                self.log.debug(format!("Skipping binary file {}", path));
            } else {
                self.ready.push_back(path);
            }
        }

        // Reverse so the first subdirectory is walked first
        self.dirs.extend(subdirs.into_iter().rev());
    }
}

/// Collect every syncable path under the root.
pub async fn scan<F>(fs: &F, rules: &IgnoreRules, log: Logger) -> Vec<String>
where
    F: FileSystem + ?Sized,
{
    Scan::new(fs, rules, log).collect().await
}
