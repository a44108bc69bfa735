use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::FilterError;
use crate::record::path_to_slash;

/// Paths excluded from hashing.
///
/// A path is excluded when any regular expression matches somewhere in its
/// slash-separated form, or when any glob matches the whole path.
#[derive(Debug, Clone)]
pub struct PathFilter {
    patterns: RegexSet,
    globs: GlobSet,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            patterns: RegexSet::empty(),
            globs: GlobSet::empty(),
        }
    }
}

impl PathFilter {
    pub fn new(patterns: &[String], globs: &[String]) -> Result<Self, FilterError> {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
            globs: build_globset(globs)?,
        })
    }

    /// Load regular expressions from an ignore file: one per line, blank lines
    /// and lines starting with `#` are ignored.
    pub fn load_patterns(ignore_file: &Path) -> Result<Vec<String>, FilterError> {
        let text = std::fs::read_to_string(ignore_file).map_err(|source| FilterError::Io {
            path: ignore_file.to_path_buf(),
            source,
        })?;
        Ok(text
            .lines()
            .filter(|line| !line.starts_with('#'))
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.globs.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.is_empty() {
            return false;
        }
        let text = path_to_slash(path);
        self.patterns.is_match(&text) || self.globs.is_match(&text)
    }
}

/// Lazily list every non-directory entry under `root`, depth first.
///
/// Symlinks are listed but not followed. Entries that cannot be read are
/// logged and left out.
pub fn files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| entry.into_path())
}

/// Number of regular files under `root` and their total size in bytes.
pub fn survey(root: &Path) -> (u64, u64) {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .fold((0, 0), |(count, bytes), entry| {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (count + 1, bytes + len)
        })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, FilterError> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(builder.build()?)
}
