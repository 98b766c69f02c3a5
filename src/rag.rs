//! Retrieval over the memory directory.
//!
//! [`RagManager`] owns the in-memory index for a session. It is built once
//! at startup by [`RagManager::initialize`] and queried once per user turn by
//! [`RagManager::retrieve`].
//!
//! # Index build
//!
//! ```text
//! scan dir ──▶ per file: cache fresh? ──yes──▶ reuse chunks + vectors
//!                              │
//!                              no
//!                              ▼
//!                   read ─▶ chunk ─▶ embed in batches ─▶ store in cache
//!
//! then: drop cache entries for vanished files, save cache
//! ```
//!
//! Files are processed in path order, so the index (and tie-breaking at
//! query time) is identical across runs. Nothing here aborts the session:
//! a file that cannot be read or embedded is skipped and listed in the
//! [`IndexReport`]; a query that cannot be embedded yields no context.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use memchat_core::chunk::chunk_text;
use memchat_core::embedding::{embed_query, EmbeddingProvider};
use memchat_core::index::{MemoryIndex, RetrievalResult};
use memchat_core::models::Chunk;
use memchat_core::tokenizer::Tokenizer;

use crate::cache::{CacheEntry, EmbeddingCache, LoadStatus};
use crate::config::{Config, MemoryConfig};
use crate::memory::{content_hash, scan_memory, SourceFile};
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress};

/// A memory file left out of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// What one index build did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Eligible files found in the memory directory.
    pub files: usize,
    /// Files served from the cache without embedding.
    pub cached: usize,
    /// Files chunked and embedded in this run.
    pub embedded: usize,
    /// Stale files with no text. Indexed with no chunks, no embedding call.
    pub empty: usize,
    pub failed: Vec<FileFailure>,
    /// Chunks in the resulting index.
    pub chunks: usize,
    /// Cache entries dropped because their file no longer exists.
    pub removed: usize,
    /// How the cache loaded. `None` when the memory directory is missing or
    /// embeddings are disabled.
    pub cache: Option<LoadStatus>,
    /// Set when the cache could not be written. The index is still usable.
    pub save_error: Option<String>,
}

/// Index summary for `/stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RagStats {
    pub files: usize,
    pub chunks: usize,
    pub dims: Option<usize>,
    pub model: String,
}

pub struct RagManager {
    memory: MemoryConfig,
    max_chars: usize,
    top_k: usize,
    batch_size: usize,
    provider: Arc<dyn EmbeddingProvider>,
    tokenizer: Arc<dyn Tokenizer>,
    progress: Box<dyn IndexProgressReporter>,
    index: MemoryIndex,
}

impl RagManager {
    pub fn new(
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        Self {
            memory: config.memory.clone(),
            max_chars: config.chunking.max_chars,
            top_k: config.retrieval.top_k,
            batch_size: config.embedding.batch_size.max(1),
            provider,
            tokenizer,
            progress: Box::new(NoProgress),
            index: MemoryIndex::new(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn index(&self) -> &MemoryIndex {
        &self.index
    }

    pub fn stats(&self) -> RagStats {
        RagStats {
            files: self.index.sources().len(),
            chunks: self.index.len(),
            dims: self.index.dims(),
            model: self.provider.model_name().to_string(),
        }
    }

    /// Build the index from the memory directory and the cache.
    ///
    /// Replaces any previous index. Always succeeds; problems are logged
    /// and recorded in the report.
    pub async fn initialize(&mut self) -> IndexReport {
        self.index = MemoryIndex::new();
        let mut report = IndexReport::default();

        if !self.memory.dir.is_dir() {
            info!(dir = %self.memory.dir.display(), "no memory directory; retrieval disabled");
            return report;
        }

        let files = match scan_memory(&self.memory) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "failed to scan memory directory; retrieval disabled");
                return report;
            }
        };
        report.files = files.len();

        // A placeholder provider must not clobber vectors built by a real one.
        let mut cache = if self.provider.is_enabled() {
            let mut cache =
                EmbeddingCache::new(self.memory.cache_path(), self.provider.model_name());
            report.cache = Some(cache.load());
            Some(cache)
        } else {
            info!("embeddings disabled; leaving the embedding cache untouched");
            None
        };

        // Decide fresh vs stale up front so progress has a total.
        let mut plan = Vec::with_capacity(files.len());
        for file in &files {
            let cached = match &cache {
                Some(cache) => self.check_cache(cache, file),
                None => Ok(None),
            };
            match cached {
                Ok(Some(entry)) => plan.push((file, Plan::Cached(entry))),
                Ok(None) => plan.push((file, Plan::Embed)),
                Err(e) => {
                    warn!(file = %file.key, error = %format!("{:#}", e), "skipping memory file");
                    report.failed.push(failure(file, &e));
                }
            }
        }
        let stale = plan
            .iter()
            .filter(|(_, p)| matches!(p, Plan::Embed))
            .count() as u64;
        self.progress.report(IndexProgressEvent::Scanned {
            files: files.len() as u64,
            stale,
        });

        let mut done = 0u64;
        let mut changed = false;
        for (file, step) in plan {
            let (entry, from_cache) = match step {
                Plan::Cached(entry) => (entry, true),
                Plan::Embed => {
                    done += 1;
                    let result = self.embed_file(file).await;
                    self.progress.report(IndexProgressEvent::Embedding {
                        file: file.key.clone(),
                        n: done,
                        total: stale,
                    });
                    match result {
                        Ok(entry) => (entry, false),
                        Err(e) => {
                            warn!(file = %file.key, error = %format!("{:#}", e), "skipping memory file");
                            report.failed.push(failure(file, &e));
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = self
                .index
                .insert_file(entry.chunks.clone(), entry.embeddings.clone())
            {
                warn!(file = %file.key, error = %e, "skipping memory file");
                report.failed.push(failure(file, &e));
                continue;
            }

            if from_cache {
                report.cached += 1;
                continue;
            }
            if entry.chunks.is_empty() {
                report.empty += 1;
            } else {
                report.embedded += 1;
            }
            if let Some(cache) = cache.as_mut() {
                match cache.store(entry) {
                    Ok(()) => changed = true,
                    Err(e) => warn!(file = %file.key, error = %e, "not caching memory file"),
                }
            }
        }

        if let Some(cache) = cache.as_mut() {
            let live: HashSet<String> = files.iter().map(|f| f.key.clone()).collect();
            report.removed = cache.retain(&live);
            changed |= report.removed > 0
                || matches!(report.cache, Some(LoadStatus::Missing | LoadStatus::Corrupt(_)));

            // After a model change with nothing re-embedded, the old file
            // is still the best cache there is.
            if changed {
                if let Err(e) = cache.save() {
                    warn!(error = %format!("{:#}", e), "embedding cache not saved; continuing");
                    report.save_error = Some(format!("{:#}", e));
                }
            }
        }

        report.chunks = self.index.len();
        info!(
            files = report.files,
            cached = report.cached,
            embedded = report.embedded,
            empty = report.empty,
            failed = report.failed.len(),
            chunks = report.chunks,
            "memory index ready"
        );
        report
    }

    /// Cached entry for `file` if still valid.
    fn check_cache(&self, cache: &EmbeddingCache, file: &SourceFile) -> Result<Option<CacheEntry>> {
        let hash = if self.memory.verify_content_hash {
            Some(content_hash(&file.read_text()?))
        } else {
            None
        };
        Ok(cache.fresh(&file.key, file.modified, hash.as_deref()).cloned())
    }

    /// Read, chunk and embed one file.
    async fn embed_file(&self, file: &SourceFile) -> Result<CacheEntry> {
        let text = file.read_text()?;
        let chunks = chunk_text(&file.key, &text, self.max_chars);
        debug!(file = %file.key, chunks = chunks.len(), "embedding memory file");
        let embeddings = self.embed_chunks(&chunks).await?;

        Ok(CacheEntry {
            path: file.key.clone(),
            modified: file.modified,
            content_hash: Some(content_hash(&text)),
            chunks,
            embeddings,
        })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let mut out = self.provider.embed(&texts).await?;
            if out.len() != texts.len() {
                bail!(
                    "embedding provider returned {} vectors for {} chunks",
                    out.len(),
                    texts.len()
                );
            }
            vectors.append(&mut out);
        }
        Ok(vectors)
    }

    /// Rank the index against `query` and fill at most `budget` tokens.
    ///
    /// Returns an empty result without calling the provider when the index
    /// is empty or the budget is zero. A failed query embedding also yields
    /// an empty result.
    pub async fn retrieve(&self, query: &str, budget: usize) -> RetrievalResult {
        if self.index.is_empty() || budget == 0 {
            return RetrievalResult::empty();
        }

        let vector = match embed_query(self.provider.as_ref(), query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "query embedding failed; answering without memory");
                return RetrievalResult::empty();
            }
        };
        if self.index.dims() != Some(vector.len()) {
            warn!(
                query_dims = vector.len(),
                index_dims = ?self.index.dims(),
                "query embedding has the wrong dimensionality; answering without memory"
            );
            return RetrievalResult::empty();
        }

        let result = self
            .index
            .retrieve(&vector, budget, Some(self.top_k), self.tokenizer.as_ref());
        debug!(
            chunks = result.len(),
            tokens = result.total_tokens,
            budget,
            "retrieved memory context"
        );
        result
    }
}

enum Plan {
    Cached(CacheEntry),
    Embed,
}

fn failure(file: &SourceFile, error: &anyhow::Error) -> FileFailure {
    FileFailure {
        path: file.key.clone(),
        error: format!("{:#}", error),
    }
}
