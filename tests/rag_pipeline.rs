//! Index build, cache reuse and retrieval through [`RagManager`] with
//! deterministic embedding providers.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use memchat::cache::LoadStatus;
use memchat::config::Config;
use memchat::embedding::DisabledProvider;
use memchat::rag::RagManager;
use memchat::session::ChatSession;
use memchat_core::embedding::EmbeddingProvider;
use memchat_core::prompt::PromptAssembler;
use memchat_core::tokenizer::EstimateTokenizer;

const VOCAB: [&str; 6] = ["penguin", "krill", "fish", "tea", "brew", "rust"];

/// One dimension per vocabulary word (occurrence count) plus a constant
/// so no vector is all zeros. Fails on any text containing `POISON`.
struct KeywordEmbedder {
    model: String,
    calls: Arc<AtomicUsize>,
}

impl KeywordEmbedder {
    fn new(model: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(Self {
            model: model.to_string(),
            calls: calls.clone(),
        });
        (provider, calls)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|text| {
                if text.contains("POISON") {
                    bail!("refusing to embed poisoned text");
                }
                let lower = text.to_lowercase();
                let mut v: Vec<f32> = VOCAB
                    .iter()
                    .map(|w| lower.matches(w).count() as f32)
                    .collect();
                v.push(0.1);
                Ok(v)
            })
            .collect()
    }
}

/// Same vector for every text, with a chosen dimensionality.
struct FlatEmbedder {
    model: String,
    dims: usize,
}

#[async_trait]
impl EmbeddingProvider for FlatEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0; self.dims]).collect())
    }
}

fn setup() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let memory = tmp.path().join("memory");
    fs::create_dir_all(&memory).unwrap();
    fs::write(
        memory.join("penguins.md"),
        "# Penguins\n\nPenguins eat krill and small fish.",
    )
    .unwrap();
    fs::write(
        memory.join("tea.txt"),
        "Brew green tea at 80 degrees. Never brew it with boiling water.",
    )
    .unwrap();

    let mut config = Config::default();
    config.memory.dir = memory;
    (tmp, config)
}

fn manager(config: &Config, provider: Arc<KeywordEmbedder>) -> RagManager {
    RagManager::new(config, provider, Arc::new(EstimateTokenizer))
}

fn touch(path: &Path, when: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

#[tokio::test]
async fn test_second_run_served_from_cache() {
    let (_tmp, config) = setup();

    let (provider, calls) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.embedded, 2);
    assert_eq!(report.cache, Some(LoadStatus::Missing));
    assert!(config.memory.cache_path().exists());
    assert!(calls.load(Ordering::SeqCst) > 0);

    let (provider, calls) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.cached, 2);
    assert_eq!(report.embedded, 0);
    assert_eq!(report.cache, Some(LoadStatus::Loaded { entries: 2 }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(rag.index().len(), report.chunks);
}

#[tokio::test]
async fn test_rerun_builds_identical_index() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    let mut first = manager(&config, provider);
    first.initialize().await;

    let (provider, _) = KeywordEmbedder::new("kw");
    let mut second = manager(&config, provider);
    second.initialize().await;

    assert!(!first.index().is_empty());
    assert_eq!(first.index().records(), second.index().records());
}

#[tokio::test]
async fn test_modified_file_is_reembedded() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    manager(&config, provider).initialize().await;

    let tea = config.memory.dir.join("tea.txt");
    fs::write(&tea, "Rust is not a tea.").unwrap();
    touch(&tea, SystemTime::now() + Duration::from_secs(60));

    let (provider, calls) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.cached, 1);
    assert_eq!(report.embedded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_content_hash_catches_same_mtime_edit() {
    let (_tmp, mut config) = setup();
    config.memory.verify_content_hash = true;
    let (provider, _) = KeywordEmbedder::new("kw");
    manager(&config, provider).initialize().await;

    let tea = config.memory.dir.join("tea.txt");
    let before = fs::metadata(&tea).unwrap().modified().unwrap();
    fs::write(&tea, "Rust is not a tea.").unwrap();
    touch(&tea, before);

    let (provider, _) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.embedded, 1);
    assert_eq!(report.cached, 1);
}

#[tokio::test]
async fn test_penguin_chunk_ranks_first() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    rag.initialize().await;

    let result = rag.retrieve("What do penguins eat?", 1000).await;
    assert!(!result.is_empty());
    assert!(result.items[0].chunk.source.ends_with("penguins.md"));
    assert!(result.items[0].score > result.items.last().unwrap().score);
}

#[tokio::test]
async fn test_retrieval_stays_within_budget() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    rag.initialize().await;

    let result = rag.retrieve("penguin", 12).await;
    assert!(result.total_tokens <= 12);
    assert_eq!(
        result.total_tokens,
        result.items.iter().map(|i| i.tokens).sum::<usize>()
    );
}

#[tokio::test]
async fn test_zero_budget_skips_query_embedding() {
    let (_tmp, config) = setup();
    let (provider, calls) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    rag.initialize().await;
    let before = calls.load(Ordering::SeqCst);

    assert!(rag.retrieve("penguin", 0).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn test_long_file_becomes_three_chunks() {
    let (_tmp, config) = setup();
    fs::remove_file(config.memory.dir.join("tea.txt")).unwrap();
    fs::write(config.memory.dir.join("penguins.md"), "abcd ".repeat(400)).unwrap();

    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.chunks, 3);
    assert!(rag
        .index()
        .records()
        .iter()
        .all(|r| r.chunk.text.chars().count() <= 800));
}

#[tokio::test]
async fn test_failing_file_is_skipped() {
    let (_tmp, config) = setup();
    fs::write(config.memory.dir.join("bad.md"), "POISON pill").unwrap();

    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.files, 3);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].path.ends_with("bad.md"));
    assert_eq!(report.embedded, 2);
    assert_eq!(rag.stats().files, 2);
}

#[tokio::test]
async fn test_corrupt_cache_is_rebuilt() {
    let (_tmp, config) = setup();
    fs::write(config.memory.cache_path(), "{ not json").unwrap();

    let (provider, _) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert!(matches!(report.cache, Some(LoadStatus::Corrupt(_))));
    assert_eq!(report.embedded, 2);

    let (provider, calls) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.cached, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_model_change_discards_cache() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw-v1");
    manager(&config, provider).initialize().await;

    let (provider, _) = KeywordEmbedder::new("kw-v2");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(
        report.cache,
        Some(LoadStatus::ModelChanged {
            previous: "kw-v1".to_string()
        })
    );
    assert_eq!(report.embedded, 2);
}

#[tokio::test]
async fn test_disabled_provider_leaves_cache_alone() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    manager(&config, provider).initialize().await;
    let before = fs::read(config.memory.cache_path()).unwrap();

    let mut rag = RagManager::new(&config, Arc::new(DisabledProvider), Arc::new(EstimateTokenizer));
    let report = rag.initialize().await;
    assert!(report.cache.is_none());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.removed, 0);
    assert!(rag.index().is_empty());
    assert_eq!(fs::read(config.memory.cache_path()).unwrap(), before);

    let (provider, calls) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.cached, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_model_change_without_reembedding_keeps_old_cache() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw-v1");
    manager(&config, provider).initialize().await;
    let before = fs::read(config.memory.cache_path()).unwrap();

    let later = SystemTime::now() + Duration::from_secs(60);
    for name in ["penguins.md", "tea.txt"] {
        let path = config.memory.dir.join(name);
        fs::write(&path, "POISON").unwrap();
        touch(&path, later);
    }

    let (provider, _) = KeywordEmbedder::new("kw-v2");
    let report = manager(&config, provider).initialize().await;
    assert!(matches!(report.cache, Some(LoadStatus::ModelChanged { .. })));
    assert_eq!(report.embedded, 0);
    assert_eq!(report.failed.len(), 2);
    assert!(report.save_error.is_none());
    assert_eq!(fs::read(config.memory.cache_path()).unwrap(), before);
}

#[tokio::test]
async fn test_blank_file_counted_as_empty() {
    let (_tmp, config) = setup();
    fs::write(config.memory.dir.join("blank.md"), "  \n\n").unwrap();

    let (provider, calls) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.files, 3);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.empty, 1);
    assert!(report.failed.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(rag.stats().files, 2);

    let (provider, calls) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.cached, 3);
    assert_eq!(report.empty, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_embedding_failure_yields_empty_result() {
    let (_tmp, config) = setup();
    let (provider, calls) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    rag.initialize().await;
    assert!(!rag.index().is_empty());
    let before = calls.load(Ordering::SeqCst);

    let result = rag.retrieve("POISON penguin", 1000).await;
    assert!(result.is_empty());
    assert_eq!(result.total_tokens, 0);
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);
}

#[tokio::test]
async fn test_query_dimension_mismatch_yields_empty_result() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    manager(&config, provider).initialize().await;

    // Same model name, so the 7-dimensional cache is served as is.
    let provider = Arc::new(FlatEmbedder {
        model: "kw".to_string(),
        dims: 3,
    });
    let mut rag = RagManager::new(&config, provider, Arc::new(EstimateTokenizer));
    let report = rag.initialize().await;
    assert_eq!(report.cached, 2);
    assert_eq!(rag.index().dims(), Some(VOCAB.len() + 1));

    let result = rag.retrieve("penguin", 1000).await;
    assert!(result.is_empty());
    assert_eq!(result.total_tokens, 0);
}

#[tokio::test]
async fn test_cache_save_failure_is_not_fatal() {
    let (tmp, mut config) = setup();
    let blocker = tmp.path().join("blocker");
    fs::write(&blocker, "a file, not a directory").unwrap();
    config.memory.cache_file = Some(blocker.join("cache.json"));

    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.embedded, 2);
    assert!(report.save_error.is_some());
    assert!(!config.memory.cache_path().exists());

    let result = rag.retrieve("What do penguins eat?", 1000).await;
    assert!(!result.is_empty());
    assert!(result.items[0].chunk.source.ends_with("penguins.md"));
}

#[tokio::test]
async fn test_deleted_file_dropped_from_cache() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    manager(&config, provider).initialize().await;

    fs::remove_file(config.memory.dir.join("tea.txt")).unwrap();
    let (provider, _) = KeywordEmbedder::new("kw");
    let report = manager(&config, provider).initialize().await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.cached, 1);
}

#[tokio::test]
async fn test_missing_memory_dir() {
    let (tmp, mut config) = setup();
    config.memory.dir = tmp.path().join("nowhere");

    let (provider, calls) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    let report = rag.initialize().await;
    assert_eq!(report.files, 0);
    assert!(report.cache.is_none());
    assert!(!config.memory.cache_path().exists());
    assert!(rag.retrieve("penguin", 100).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_session_turn_includes_memory_and_fits() {
    let (_tmp, config) = setup();
    let (provider, _) = KeywordEmbedder::new("kw");
    let mut rag = manager(&config, provider);
    rag.initialize().await;

    let budget = config.budget();
    let assembler = PromptAssembler::new(budget, Arc::new(EstimateTokenizer));
    let mut session = ChatSession::new(assembler, "Be brief.", Some(rag));
    session.record_exchange("Hi", "Hello!");

    let prompt = session
        .prepare_turn("What do penguins eat?")
        .await
        .unwrap();
    assert!(prompt.messages[1]
        .content
        .starts_with("# Knowledge Base Context"));
    assert!(prompt.messages[1].content.contains("krill"));
    assert!(prompt.usage.rag <= budget.rag_cap());
    assert!(prompt.usage.total() + prompt.usage.reserve <= budget.context_window);
    assert_eq!(prompt.history_kept, 2);

    // Retrieved context never enters the history.
    assert_eq!(session.history().len(), 2);
}
