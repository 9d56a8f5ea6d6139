//! `.gitignore`-style rule evaluation.
//!
//! Paths handed to [`IgnoreRules::should_ignore`] are root-relative and use
//! `/` separators. A trailing `/` marks the directory form of a path, which is
//! what the scanner asks about before descending.
//!
//! A path is ignored when it, or one of its ancestor directories, is matched
//! by a rule. Negated rules are checked before everything else: if any of
//! them matches, the path is kept regardless of rule order.

use crate::fs::{FileSystem, FsError};
use crate::logging::Logger;
use glob::{MatchOptions, Pattern};
use std::time::Duration;
use web_time::Instant;

/// Name of the per-directory rule file.
pub const IGNORE_FILE: &str = ".gitignore";

/// How long loaded rules are reused before the rule files are read again.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Ordered, compiled rule set.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    rules: Vec<Rule>,
    sync_git_folder: bool,
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let rules = patterns.iter().filter_map(|p| Rule::parse(p)).collect();
        Self {
            patterns,
            rules,
            sync_git_folder: false,
        }
    }

    /// Parse the contents of a single rule file.
    pub fn parse(content: &str) -> Self {
        Self::new(parse_lines(content))
    }

    /// Let `.git` contents participate in sync. Other rules still apply to them.
    pub fn with_sync_git_folder(mut self, enabled: bool) -> Self {
        self.sync_git_folder = enabled;
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn sync_git_folder(&self) -> bool {
        self.sync_git_folder
    }

    pub fn should_ignore(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/");
        let path = normalized.trim_start_matches('/');

        if self.is_builtin_excluded(path) {
            return true;
        }

        if self
            .rules
            .iter()
            .any(|rule| rule.negated && rule.matcher.matches(path))
        {
            return false;
        }

        self.rules
            .iter()
            .filter(|rule| !rule.negated)
            .any(|rule| rule.matcher.matches(path))
    }

    fn is_builtin_excluded(&self, path: &str) -> bool {
        path.split('/')
            .any(|segment| segment == "node_modules" || (segment == ".git" && !self.sync_git_folder))
    }
}

#[derive(Debug, Clone)]
struct Rule {
    negated: bool,
    matcher: Matcher,
}

impl Rule {
    fn parse(line: &str) -> Option<Self> {
        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (rooted, body) = match body.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        if body.is_empty() {
            return None;
        }

        let matcher = if let Some(dir) = body.strip_suffix('/') {
            Matcher::Directory(PathPattern::new(dir))
        } else if !rooted && !body.contains('/') && !has_glob_meta(body) {
            Matcher::Segment(body.to_string())
        } else {
            Matcher::Path(PathPattern::new(body))
        };

        Some(Self { negated, matcher })
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Bare name: equals the path or any of its segments
    Segment(String),
    /// `dir/`: the path lies inside a matching directory
    Directory(PathPattern),
    /// The path itself or one of its ancestors matches
    Path(PathPattern),
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Segment(name) => path == name || path.split('/').any(|s| s == name),
            Matcher::Directory(pattern) => directories_of(path).any(|dir| pattern.matches(dir)),
            Matcher::Path(pattern) => self_and_ancestors(path).any(|p| pattern.matches(p)),
        }
    }
}

#[derive(Debug, Clone)]
enum PathPattern {
    Literal(String),
    Glob(Pattern),
}

impl PathPattern {
    fn new(raw: &str) -> Self {
        if !has_glob_meta(raw) {
            return PathPattern::Literal(raw.to_string());
        }
        match Pattern::new(raw) {
            Ok(pattern) => PathPattern::Glob(pattern),
            Err(e) => {
                tracing::debug!("Invalid ignore pattern {:?}: {}", raw, e);
                PathPattern::Literal(raw.to_string())
            }
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            PathPattern::Literal(literal) => candidate == literal,
            PathPattern::Glob(pattern) => pattern.matches_with(candidate, MATCH_OPTIONS),
        }
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Directories a path lives in. The path itself counts when it is given in
/// directory form (trailing `/`).
fn directories_of(path: &str) -> impl Iterator<Item = &str> {
    let is_dir_form = path.ends_with('/');
    let trimmed = path.trim_end_matches('/');
    trimmed
        .match_indices('/')
        .map(move |(i, _)| &trimmed[..i])
        .chain(is_dir_form.then_some(trimmed))
}

fn self_and_ancestors(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .match_indices('/')
        .map(move |(i, _)| &trimmed[..i])
        .chain(std::iter::once(trimmed))
}

/// Rule lines of a rule file, with comments and blank lines removed.
pub fn parse_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Re-anchor a pattern read from the rule file in `dir` so it can be
/// evaluated against root-relative paths.
///
/// Rooted and slash-containing patterns are anchored at `dir`; bare patterns
/// match at any depth below it.
pub fn scope_pattern(pattern: &str, dir: &str) -> String {
    if dir.is_empty() {
        return pattern.to_string();
    }

    let (bang, body) = match pattern.strip_prefix('!') {
        Some(rest) => ("!", rest),
        None => ("", pattern),
    };
    let dir = Pattern::escape(dir);

    let scoped = if let Some(rooted) = body.strip_prefix('/') {
        format!("/{dir}/{rooted}")
    } else if body.trim_end_matches('/').contains('/') {
        format!("/{dir}/{body}")
    } else {
        format!("/{dir}/**/{body}")
    };
    format!("{bang}{scoped}")
}

/// Collect every rule file below the root, skipping hidden directories.
pub async fn load_rules<F>(fs: &F, sync_git_folder: bool, log: &Logger) -> IgnoreRules
where
    F: FileSystem + ?Sized,
{
    let mut patterns = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        let rule_file = join(&dir, IGNORE_FILE);
        match fs.read(&rule_file).await {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                patterns.extend(parse_lines(&content).iter().map(|p| scope_pattern(p, &dir)));
            }
            Err(FsError::NotFound(_)) => {}
            Err(e) => log.warn(format!("Failed to read {}: {}", rule_file, e)),
        }

        let entries = match fs.list(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log.warn(format!("Failed to list {:?} while loading ignore rules: {}", dir, e));
                continue;
            }
        };
        for entry in entries.into_iter().filter(|e| e.is_dir) {
            if entry.name.starts_with('.') || entry.name == "node_modules" {
                continue;
            }
            pending.push(join(&dir, &entry.name));
        }
    }

    log.debug(format!("Loaded {} ignore patterns", patterns.len()));
    IgnoreRules::new(patterns).with_sync_git_folder(sync_git_folder)
}

pub(crate) fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Loaded rules, re-read once they are older than the TTL.
#[derive(Debug)]
pub struct IgnoreCache {
    rules: IgnoreRules,
    loaded_at: Option<Instant>,
    ttl: Duration,
    sync_git_folder: bool,
}

impl IgnoreCache {
    pub fn new(ttl: Duration, sync_git_folder: bool) -> Self {
        Self {
            rules: IgnoreRules::default().with_sync_git_folder(sync_git_folder),
            loaded_at: None,
            ttl,
            sync_git_folder,
        }
    }

    /// Current rules, reloading from `fs` when stale.
    pub async fn rules<F>(&mut self, fs: &F, log: &Logger) -> &IgnoreRules
    where
        F: FileSystem + ?Sized,
    {
        let fresh = self.loaded_at.is_some_and(|at| at.elapsed() < self.ttl);
        if !fresh {
            self.rules = load_rules(fs, self.sync_git_folder, log).await;
            self.loaded_at = Some(Instant::now());
        }
        &self.rules
    }

    /// Force a reload on next access.
    pub fn invalidate(&mut self) {
        self.loaded_at = None;
    }
}
