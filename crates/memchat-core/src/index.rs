//! In-memory similarity index and budgeted retrieval.
//!
//! Holds every (chunk, vector) pair of the session in insertion order.
//! Search is brute-force cosine similarity over all stored vectors, which is
//! plenty for a personal memory directory.
//!
//! # Retrieval
//!
//! 1. Score every record against the query vector.
//! 2. Stable-sort by score, descending; ties keep insertion order.
//! 3. Consider at most `top_k` candidates.
//! 4. Accept candidates in rank order while their exact token counts fit the
//!    budget; the first candidate that does not fit ends the scan.

use std::collections::BTreeSet;

use anyhow::{bail, Result};

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, EmbeddingRecord};
use crate::tokenizer::Tokenizer;

/// All embedded chunks held for the current session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryIndex {
    records: Vec<EmbeddingRecord>,
    dims: Option<usize>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector dimensionality, fixed by the first inserted record.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    /// Distinct source files represented in the index, sorted.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.records
            .iter()
            .map(|r| r.chunk.source.as_str())
            .collect()
    }

    /// Whether every vector matches the index dimensionality.
    pub fn accepts(&self, vectors: &[Vec<f32>]) -> bool {
        let Some(first) = vectors.first() else {
            return true;
        };
        let dims = self.dims.unwrap_or(first.len());
        dims > 0 && vectors.iter().all(|v| v.len() == dims)
    }

    /// Add all chunks of one file with their parallel vectors.
    ///
    /// Nothing is inserted when the lengths differ or a vector has the wrong
    /// dimensionality.
    pub fn insert_file(&mut self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
        if chunks.len() != vectors.len() {
            bail!(
                "{} chunks but {} embeddings",
                chunks.len(),
                vectors.len()
            );
        }
        if !self.accepts(&vectors) {
            bail!(
                "embedding dimensionality mismatch (index has {:?})",
                self.dims
            );
        }
        if let Some(first) = vectors.first() {
            self.dims.get_or_insert(first.len());
        }
        self.records.extend(
            chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| EmbeddingRecord { chunk, vector }),
        );
        Ok(())
    }

    /// Score every record against `query`, best first.
    ///
    /// Returns `(record position, similarity)` pairs. The sort is stable, so
    /// equal scores keep insertion order.
    pub fn rank(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, cosine_similarity(query, &r.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
    }

    /// Rank against `query` and greedily fill `budget` tokens.
    ///
    /// No partial chunk is ever included, and the summed token count of the
    /// result never exceeds `budget`.
    pub fn retrieve(
        &self,
        query: &[f32],
        budget: usize,
        top_k: Option<usize>,
        tokenizer: &dyn Tokenizer,
    ) -> RetrievalResult {
        let limit = top_k.unwrap_or(usize::MAX);
        let mut result = RetrievalResult::default();

        for (pos, score) in self.rank(query).into_iter().take(limit) {
            let chunk = &self.records[pos].chunk;
            let tokens = tokenizer.count_tokens(&chunk.text);
            if result.total_tokens + tokens > budget {
                break;
            }
            result.total_tokens += tokens;
            result.items.push(RetrievedChunk {
                chunk: chunk.clone(),
                score,
                tokens,
            });
        }

        result
    }
}

/// One accepted chunk with its similarity and exact token count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub tokens: usize,
}

/// Ranked chunks for one user turn, descending by score.
///
/// Recomputed every turn and never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedChunk>,
    pub total_tokens: usize,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Chunk texts joined by blank lines, best first.
    pub fn context_text(&self) -> String {
        self.items
            .iter()
            .map(|i| i.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Drop the lowest-ranked chunk.
    pub fn pop_last(&mut self) -> Option<RetrievedChunk> {
        let item = self.items.pop()?;
        self.total_tokens -= item.tokens;
        Some(item)
    }
}
