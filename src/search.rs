use anyhow::Result;

use memchat_core::index::RetrievalResult;

use crate::config::Config;
use crate::index_cmd::open_memory;
use crate::progress::ProgressMode;
use crate::tokenizer::create_tokenizer;

/// `memchat search`: retrieve memory chunks for `query` and print them.
///
/// `budget` defaults to the retrieval cap of the configured window.
pub async fn run_search(config: &Config, query: &str, budget: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let (rag, _) = open_memory(config, tokenizer, ProgressMode::default_for_tty()).await?;
    let budget = budget.unwrap_or_else(|| config.budget().rag_cap());

    let result = rag.retrieve(query, budget).await;
    print_results(&result, budget);
    Ok(())
}

fn print_results(result: &RetrievalResult, budget: usize) {
    if result.is_empty() {
        println!("No results.");
        return;
    }

    for (i, item) in result.items.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} #{}",
            i + 1,
            item.score,
            item.chunk.source,
            item.chunk.index
        );
        println!("    tokens: {}", item.tokens);
        println!("    excerpt: \"{}\"", excerpt(&item.chunk.text, 240));
        println!();
    }
    println!("{} tokens of {} budget", result.total_tokens, budget);
}

/// First `max` characters on one line.
fn excerpt(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &flat[..end]),
        None => flat.to_string(),
    }
}
