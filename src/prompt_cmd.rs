//! `memchat prompt`: show exactly what would be sent to the model for one
//! message, without generating.

use anyhow::Result;
use std::path::Path;

use memchat_core::prompt::{AssembledPrompt, PromptAssembler};

use crate::config::Config;
use crate::history::read_chat_file;
use crate::index_cmd::open_memory;
use crate::progress::ProgressMode;
use crate::session::ChatSession;
use crate::system_prompt::load_system_prompt;
use crate::tokenizer::create_tokenizer;

/// Build a [`ChatSession`] from `config`: tokenizer, system prompt, and
/// (when retrieval is enabled) an initialized memory index.
pub async fn open_session(config: &Config, progress: ProgressMode) -> Result<ChatSession> {
    let tokenizer = create_tokenizer(&config.tokenizer)?;
    let assembler = PromptAssembler::new(config.budget(), tokenizer.clone());
    let system_prompt = load_system_prompt(&config.chat.system_prompt_file);

    let rag = if config.retrieval.enabled {
        let (rag, report) = open_memory(config, tokenizer, progress).await?;
        if !report.failed.is_empty() {
            eprintln!(
                "{} memory file(s) skipped; run `memchat index` for details.",
                report.failed.len()
            );
        }
        Some(rag)
    } else {
        None
    };

    Ok(ChatSession::new(assembler, system_prompt, rag))
}

pub async fn run_prompt(config: &Config, message: &str, history: Option<&Path>) -> Result<()> {
    let mut session = open_session(config, ProgressMode::default_for_tty()).await?;
    if let Some(path) = history {
        session.set_history(read_chat_file(path)?);
    }

    let prompt = session.prepare_turn(message).await?;
    print!("{}", prompt.render());
    println!();
    print_usage(&prompt);
    Ok(())
}

fn print_usage(prompt: &AssembledPrompt) {
    let usage = &prompt.usage;
    println!("Token usage");
    println!("===========");
    println!("  window:        {}", usage.window);
    println!("  reserve:       {}", usage.reserve);
    println!("  system:        {}", usage.system);
    println!("  context:       {} ({} chunks)", usage.rag, prompt.rag.len());
    println!(
        "  history:       {} ({} kept, {} dropped)",
        usage.history, prompt.history_kept, prompt.history_dropped
    );
    println!("  message:       {}", usage.current_turn);
    println!("  cue:           {}", usage.cue);
    println!("  total:         {}", usage.total());
}
