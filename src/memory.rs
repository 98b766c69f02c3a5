//! Memory directory scanning.
//!
//! Walks the configured memory directory and lists the files eligible for
//! retrieval: anything matching `include_globs` (default `**/*.md` and
//! `**/*.txt`) whose file name is not in `exclude_files` (README files by
//! default). Hidden VCS and build directories are always skipped.
//!
//! Files are identified by absolute path and returned sorted by it, so the
//! index is built in the same order on every run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::MemoryConfig;

/// One eligible file in the memory directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Identity used by the cache and on chunks (the absolute path as text).
    pub key: String,
    pub modified: DateTime<Utc>,
}

impl SourceFile {
    /// Read the raw text. Only called on a cache miss or when hashing.
    pub fn read_text(&self) -> Result<String> {
        std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read memory file: {}", self.path.display()))
    }
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// List eligible files under `config.dir`.
///
/// A missing directory yields an empty list. Entries that cannot be read
/// are logged and skipped.
pub fn scan_memory(config: &MemoryConfig) -> Result<Vec<SourceFile>> {
    let root = &config.dir;
    if !root.is_dir() {
        warn!(dir = %root.display(), "memory directory not found; retrieval disabled");
        return Ok(Vec::new());
    }
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("Failed to resolve memory directory: {}", root.display()))?;

    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&[
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ])?;

    let mut files = Vec::new();

    let walker = WalkDir::new(&root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry in memory directory");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if config.exclude_files.iter().any(|f| f.as_str() == name) {
            debug!(file = %rel_str, "excluded by name");
            continue;
        }

        match source_file(path) {
            Ok(file) => files.push(file),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping memory file"),
        }
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(files)
}

fn source_file(path: &Path) -> Result<SourceFile> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .with_context(|| format!("No modification time for {}", path.display()))?;

    Ok(SourceFile {
        path: path.to_path_buf(),
        key: path.to_string_lossy().to_string(),
        modified: DateTime::<Utc>::from(modified),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
