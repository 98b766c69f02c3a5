//! Persistent embedding cache.
//!
//! Keeps the chunks and vectors of every memory file between runs so that
//! unchanged files are never re-embedded. The cache is one JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "model": "nomic-embed-text",
//!   "entries": [
//!     {
//!       "path": "/home/me/memory/penguins.md",
//!       "modified": "2026-03-01T09:12:44.123456789Z",
//!       "content_hash": null,
//!       "chunks": [{ "source": "...", "index": 0, "text": "...", "token_estimate": 120 }],
//!       "embeddings": ["<base64 of little-endian f32>"]
//!     }
//!   ]
//! }
//! ```
//!
//! An entry is fresh when its stored modification time equals the file's
//! current one exactly (and, when content verification is on, its SHA-256
//! matches as well). Vectors written by a different embedding model are
//! discarded on load.
//!
//! A cache that cannot be read or parsed degrades to an empty one. Saving
//! replaces the file atomically.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use memchat_core::models::Chunk;

use crate::atomic::write_atomic;

/// Bumped whenever the on-disk layout changes.
pub const CACHE_VERSION: u32 = 1;

/// Cached chunks and vectors for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    /// Modification time of the file when it was embedded.
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub chunks: Vec<Chunk>,
    /// One vector per chunk, in chunk order.
    #[serde(with = "vector_blobs")]
    pub embeddings: Vec<Vec<f32>>,
}

impl CacheEntry {
    pub fn is_consistent(&self) -> bool {
        self.chunks.len() == self.embeddings.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    model: String,
    entries: Vec<CacheEntry>,
}

/// Outcome of [`EmbeddingCache::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// No cache file yet.
    Missing,
    Loaded { entries: usize },
    /// The cache belonged to another embedding model and was discarded.
    ModelChanged { previous: String },
    /// The file was unreadable or malformed and was ignored.
    Corrupt(String),
}

/// In-memory view of the cache file.
#[derive(Debug)]
pub struct EmbeddingCache {
    path: PathBuf,
    model: String,
    entries: BTreeMap<String, CacheEntry>,
}

impl EmbeddingCache {
    /// An empty cache bound to `path` for vectors from `model`.
    pub fn new(path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model: model.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the in-memory entries with the contents of the cache file.
    ///
    /// Never fails: every problem degrades to an empty cache and is
    /// reported through the returned status.
    pub fn load(&mut self) -> LoadStatus {
        self.entries.clear();

        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no embedding cache yet");
                return LoadStatus::Missing;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "embedding cache unreadable; starting empty");
                return LoadStatus::Corrupt(e.to_string());
            }
        };

        let file: CacheFile = match serde_json::from_slice(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "embedding cache corrupt; starting empty");
                return LoadStatus::Corrupt(e.to_string());
            }
        };

        if file.version != CACHE_VERSION {
            warn!(
                found = file.version,
                expected = CACHE_VERSION,
                "unsupported embedding cache version; starting empty"
            );
            return LoadStatus::Corrupt(format!("unsupported cache version {}", file.version));
        }

        if file.model != self.model {
            info!(
                previous = %file.model,
                current = %self.model,
                "embedding model changed; discarding cached vectors"
            );
            return LoadStatus::ModelChanged {
                previous: file.model,
            };
        }

        for entry in file.entries {
            if !entry.is_consistent() {
                warn!(path = %entry.path, "dropping cache entry with mismatched chunk and vector counts");
                continue;
            }
            self.entries.insert(entry.path.clone(), entry);
        }

        info!(entries = self.entries.len(), "loaded embedding cache");
        LoadStatus::Loaded {
            entries: self.entries.len(),
        }
    }

    pub fn lookup(&self, path: &str) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    /// The entry for `path` if it is still valid for a file last modified at
    /// `modified`.
    ///
    /// When `content_hash` is given, the stored hash must match it too.
    pub fn fresh(
        &self,
        path: &str,
        modified: DateTime<Utc>,
        content_hash: Option<&str>,
    ) -> Option<&CacheEntry> {
        let entry = self.lookup(path)?;
        if entry.modified != modified {
            return None;
        }
        if let Some(hash) = content_hash {
            if entry.content_hash.as_deref() != Some(hash) {
                return None;
            }
        }
        Some(entry)
    }

    /// Insert or replace the entry for its path.
    pub fn store(&mut self, entry: CacheEntry) -> Result<()> {
        if !entry.is_consistent() {
            bail!(
                "cache entry for {} has {} chunks but {} embeddings",
                entry.path,
                entry.chunks.len(),
                entry.embeddings.len()
            );
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    /// Drop entries whose path is not in `live`. Returns how many went.
    pub fn retain(&mut self, live: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| live.contains(path));
        before - self.entries.len()
    }

    /// Write the cache file atomically.
    pub fn save(&self) -> Result<()> {
        let file = CacheFile {
            version: CACHE_VERSION,
            model: self.model.clone(),
            entries: self.entries.values().cloned().collect(),
        };
        let data = serde_json::to_vec(&file).context("Failed to serialize embedding cache")?;
        write_atomic(&self.path, &data)
            .with_context(|| format!("Failed to save embedding cache: {}", self.path.display()))?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "saved embedding cache");
        Ok(())
    }
}

/// Vectors as base64 strings of little-endian f32 bytes.
mod vector_blobs {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use memchat_core::embedding::{blob_to_vec, vec_to_blob};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(vectors: &[Vec<f32>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(vectors.iter().map(|v| STANDARD.encode(vec_to_blob(v))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<f32>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| {
                let bytes = STANDARD.decode(s).map_err(D::Error::custom)?;
                if bytes.len() % 4 != 0 {
                    return Err(D::Error::custom("vector blob length is not a multiple of 4"));
                }
                Ok(blob_to_vec(&bytes))
            })
            .collect()
    }
}
