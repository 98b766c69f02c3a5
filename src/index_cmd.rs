//! `memchat index`: build the memory index and report what happened.
//!
//! Also home to [`open_memory`], which every command that needs retrieval
//! uses to build its [`RagManager`].

use anyhow::Result;
use std::sync::Arc;

use memchat_core::tokenizer::Tokenizer;

use crate::cache::LoadStatus;
use crate::config::Config;
use crate::embedding::create_provider;
use crate::progress::ProgressMode;
use crate::rag::{IndexReport, RagManager};

/// Build and initialize a [`RagManager`] from `config`.
///
/// Fails only on a broken embedding configuration; indexing problems are
/// carried in the returned report.
pub async fn open_memory(
    config: &Config,
    tokenizer: Arc<dyn Tokenizer>,
    progress: ProgressMode,
) -> Result<(RagManager, IndexReport)> {
    let provider = create_provider(&config.embedding)?;
    let mut rag = RagManager::new(config, provider, tokenizer).with_progress(progress.reporter());
    let report = rag.initialize().await;
    Ok((rag, report))
}

pub async fn run_index(config: &Config, progress: Option<ProgressMode>) -> Result<()> {
    let tokenizer = crate::tokenizer::create_tokenizer(&config.tokenizer)?;
    let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
    let (rag, report) = open_memory(config, tokenizer, progress).await?;

    print_report(config, &report);
    if let Some(dims) = rag.index().dims() {
        println!("  dims:      {}", dims);
    }
    Ok(())
}

fn print_report(config: &Config, report: &IndexReport) {
    let dir = config.memory.dir.display();
    if !config.memory.dir.is_dir() {
        println!("Memory directory {} not found; retrieval disabled.", dir);
        return;
    }

    println!("Memory index ({})", dir);
    println!("==================");
    println!("  files:     {}", report.files);
    println!("  cached:    {}", report.cached);
    println!("  embedded:  {}", report.embedded);
    println!("  empty:     {}", report.empty);
    println!("  failed:    {}", report.failed.len());
    println!("  removed:   {}", report.removed);
    println!("  chunks:    {}", report.chunks);
    match &report.cache {
        Some(cache) => println!("  cache:     {}", describe_cache(cache)),
        None => println!("  cache:     untouched (embeddings disabled)"),
    }

    for failure in &report.failed {
        println!("    skipped {}: {}", failure.path, failure.error);
    }
    if let Some(err) = &report.save_error {
        println!("  warning: cache not saved: {}", err);
    }
}

fn describe_cache(status: &LoadStatus) -> String {
    match status {
        LoadStatus::Missing => "new".to_string(),
        LoadStatus::Loaded { entries } => format!("loaded ({} entries)", entries),
        LoadStatus::ModelChanged { previous } => {
            format!("discarded (built with model {})", previous)
        }
        LoadStatus::Corrupt(reason) => format!("discarded (unreadable: {})", reason),
    }
}
