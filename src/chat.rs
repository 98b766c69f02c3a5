//! Interactive chat loop.
//!
//! Reads one message per line. Lines starting with `/` are commands:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `/save [name]` | Save the conversation (timestamped name by default) |
//! | `/stats` | Show memory index statistics |
//! | `/help` | List commands |
//! | `/quit`, `/exit` | Leave (so does end of input) |

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use crate::config::Config;
use crate::generate::{create_generator, Generator};
use crate::history::ChatStore;
use crate::progress::ProgressMode;
use crate::prompt_cmd::open_session;
use crate::session::ChatSession;

const HELP: &str = "Commands: /save [name], /stats, /help, /quit";

pub struct ChatLoop {
    session: ChatSession,
    generator: Arc<dyn Generator>,
    store: ChatStore,
    autosave: bool,
    /// File the conversation is saved to once named.
    chat_name: Option<String>,
}

impl ChatLoop {
    pub fn new(
        session: ChatSession,
        generator: Arc<dyn Generator>,
        store: ChatStore,
        autosave: bool,
    ) -> Self {
        Self {
            session,
            generator,
            store,
            autosave,
            chat_name: None,
        }
    }

    /// Continue saving into an existing conversation file.
    pub fn with_chat_name(mut self, name: impl Into<String>) -> Self {
        self.chat_name = Some(name.into());
        self
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Run until `/quit` or end of input.
    pub async fn run<R, W>(&mut self, input: R, out: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: Write + Send,
    {
        let mut lines = BufReader::new(input).lines();

        loop {
            write!(out, "\n> ")?;
            out.flush()?;

            let Some(line) = lines.next_line().await? else {
                writeln!(out)?;
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(command) = line.strip_prefix('/') {
                let (name, arg) = match command.split_once(char::is_whitespace) {
                    Some((name, arg)) => (name, Some(arg.trim()).filter(|a| !a.is_empty())),
                    None => (command, None),
                };
                match name {
                    "quit" | "exit" => break,
                    "save" => self.save(arg, false, out)?,
                    "stats" => self.print_stats(out)?,
                    "help" => writeln!(out, "{}", HELP)?,
                    other => writeln!(out, "Unknown command /{}. {}", other, HELP)?,
                }
                continue;
            }

            self.handle_message(line, out).await?;
        }

        Ok(())
    }

    async fn handle_message<W: Write + Send>(&mut self, input: &str, out: &mut W) -> Result<()> {
        let prompt = match self.session.prepare_turn(input).await {
            Ok(prompt) => prompt,
            Err(e) => {
                writeln!(out, "Error: {:#}", e)?;
                return Ok(());
            }
        };

        if !prompt.rag.is_empty() {
            writeln!(
                out,
                "Retrieved {} tokens of context from {} chunks",
                prompt.usage.rag,
                prompt.rag.len()
            )?;
        }

        let result = {
            let mut sink = |token: &str| {
                let _ = write!(out, "{}", token);
                let _ = out.flush();
            };
            self.generator.generate(&prompt, &mut sink).await
        };

        match result {
            Ok(reply) => {
                writeln!(out)?;
                self.session.record_exchange(input, reply);
                if self.autosave {
                    self.save(None, true, out)?;
                }
            }
            Err(e) => writeln!(out, "\nGeneration failed: {:#}", e)?,
        }
        Ok(())
    }

    fn save<W: Write>(&mut self, name: Option<&str>, auto: bool, out: &mut W) -> Result<()> {
        let name = name.map(str::to_string).or_else(|| self.chat_name.clone());
        match self.store.save(&self.session.transcript(), name.as_deref()) {
            Ok(saved) => {
                if auto {
                    writeln!(out, "(auto-saved to {})", saved)?;
                } else {
                    writeln!(out, "Chat saved: {}", saved)?;
                }
                self.chat_name = Some(saved);
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "chat save failed");
                writeln!(out, "Failed to save: {:#}", e)?;
            }
        }
        Ok(())
    }

    fn print_stats<W: Write>(&self, out: &mut W) -> Result<()> {
        match self.session.rag() {
            Some(rag) => {
                let stats = rag.stats();
                writeln!(out, "Memory: {} files, {} chunks", stats.files, stats.chunks)?;
                writeln!(
                    out,
                    "Embedding model: {} ({} dims)",
                    stats.model,
                    stats
                        .dims
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "-".to_string())
                )?;
            }
            None => writeln!(out, "Memory retrieval is disabled.")?,
        }
        writeln!(out, "History: {} messages", self.session.history().len())?;
        writeln!(out, "Model: {}", self.generator.model_name())?;
        Ok(())
    }
}

/// `memchat chat`: interactive session on stdin/stdout.
///
/// `resume` names a saved conversation to continue; saves then go back
/// into the same file.
pub async fn run_chat(config: &Config, resume: Option<&str>) -> Result<()> {
    let generator = create_generator(&config.model)?;
    let store = ChatStore::new(&config.chat.history_dir);
    let mut session = open_session(config, ProgressMode::default_for_tty()).await?;

    if let Some(name) = resume {
        let messages = store.load(name)?;
        println!("Resumed {} ({} messages)", name, messages.len());
        session.set_history(messages);
    }

    match session.rag() {
        Some(rag) => {
            let stats = rag.stats();
            println!(
                "Memory: {} chunks from {} files. {}",
                stats.chunks, stats.files, HELP
            );
        }
        None => println!("Memory retrieval is disabled. {}", HELP),
    }

    let mut chat = ChatLoop::new(session, generator, store, config.chat.autosave);
    if let Some(name) = resume {
        chat = chat.with_chat_name(name);
    }
    let mut stdout = std::io::stdout();
    chat.run(tokio::io::stdin(), &mut stdout).await
}
