//! # memchat CLI
//!
//! ## Usage
//!
//! ```bash
//! memchat --config ./config/memchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `memchat index` | Build the memory index and update the embedding cache |
//! | `memchat search "<query>"` | Show the chunks retrieval would pick |
//! | `memchat prompt "<message>"` | Show the assembled prompt and its token usage |
//! | `memchat chat` | Interactive chat |
//! | `memchat chats` | List saved conversations |
//!
//! Logs go to stderr. `RUST_LOG` overrides the level; otherwise `-v` raises
//! it to `info` and `-vv` to `debug`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use memchat::progress::ProgressMode;
use memchat::{chat, config, history, index_cmd, prompt_cmd, search};

/// memchat: chat with a local model that remembers your notes.
#[derive(Parser)]
#[command(
    name = "memchat",
    about = "Local terminal chat with retrieval over a memory directory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/memchat.toml`. When the default file does not
    /// exist, built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the memory index.
    ///
    /// Scans the memory directory, reuses cached embeddings for unchanged
    /// files, embeds the rest and rewrites the cache.
    Index {
        /// Progress output on stderr. Defaults to human when stderr is a
        /// terminal, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Retrieve memory chunks for a query.
    Search {
        query: String,

        /// Token budget for retrieved chunks. Defaults to the configured
        /// share of the context window.
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Print the prompt that would be sent for a message, without
    /// generating.
    Prompt {
        message: String,

        /// Saved conversation (JSON) to use as history.
        #[arg(long)]
        history: Option<PathBuf>,
    },

    /// Start an interactive chat.
    Chat {
        /// Continue a saved conversation by name.
        #[arg(long)]
        resume: Option<String>,
    },

    /// List saved conversations, newest first.
    Chats,
}

const DEFAULT_CONFIG: &str = "./config/memchat.toml";

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load(path: Option<PathBuf>) -> anyhow::Result<config::Config> {
    match path {
        Some(path) => config::load_config(&path),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                config::load_config(&path)
            } else {
                tracing::info!("no config file at {}; using defaults", DEFAULT_CONFIG);
                Ok(config::Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = load(cli.config)?;

    match cli.command {
        Commands::Index { progress } => {
            index_cmd::run_index(&cfg, progress).await?;
        }
        Commands::Search { query, budget } => {
            search::run_search(&cfg, &query, budget).await?;
        }
        Commands::Prompt { message, history } => {
            prompt_cmd::run_prompt(&cfg, &message, history.as_deref()).await?;
        }
        Commands::Chat { resume } => {
            chat::run_chat(&cfg, resume.as_deref()).await?;
        }
        Commands::Chats => {
            history::run_list_chats(&cfg.chat)?;
        }
    }

    Ok(())
}
