//! Configuration parsing and validation.
//!
//! memchat is configured with a TOML file (default `config/memchat.toml`).
//! Every section and field has a default, so an empty file is valid:
//!
//! ```toml
//! [memory]
//! dir = "./memory"
//! verify_content_hash = false
//!
//! [chunking]
//! max_chars = 800
//!
//! [retrieval]
//! enabled = true
//! context_fraction = 0.25
//! top_k = 10
//!
//! [embedding]
//! provider = "ollama"          # "disabled" | "openai" | "ollama" | "local"
//! model = "nomic-embed-text"
//! batch_size = 32
//!
//! [tokenizer]
//! kind = "estimate"            # "estimate" | "huggingface"
//!
//! [model]
//! provider = "ollama"          # "disabled" | "ollama"
//! name = "llama3.2"
//! context_window = 4096
//! reserve_tokens = 512
//!
//! [chat]
//! history_dir = "./chats"
//! system_prompt_file = "./prompts/system.md"
//! autosave = false
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use memchat_core::prompt::BudgetConfig;

/// Name of the cache file written into the memory directory when
/// `memory.cache_file` is not set.
pub const DEFAULT_CACHE_FILE: &str = ".memchat-cache.json";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Config {
    /// Budget parameters for the prompt assembler.
    pub fn budget(&self) -> BudgetConfig {
        BudgetConfig {
            context_window: self.model.context_window,
            rag_fraction: self.retrieval.context_fraction,
            reserve_tokens: self.model.reserve_tokens,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_dir")]
    pub dir: PathBuf,
    /// Cache location. Defaults to `.memchat-cache.json` inside `dir`.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    /// File names skipped wherever they appear.
    #[serde(default = "default_exclude_files")]
    pub exclude_files: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Also compare a SHA-256 of the content before trusting a cache entry.
    #[serde(default)]
    pub verify_content_hash: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: default_memory_dir(),
            cache_file: None,
            include_globs: default_include_globs(),
            exclude_files: default_exclude_files(),
            follow_symlinks: false,
            verify_content_hash: false,
        }
    }
}

impl MemoryConfig {
    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.dir.join(DEFAULT_CACHE_FILE))
    }
}

fn default_memory_dir() -> PathBuf {
    PathBuf::from("./memory")
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

fn default_exclude_files() -> Vec<String> {
    ["README.md", "readme.md", "README.txt", "readme.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    memchat_core::chunk::DEFAULT_MAX_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum share of the context window given to retrieved chunks.
    #[serde(default = "default_context_fraction")]
    pub context_fraction: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_fraction: default_context_fraction(),
            top_k: default_top_k(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_context_fraction() -> f64 {
    memchat_core::prompt::DEFAULT_RAG_FRACTION
}
fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Expected dimensionality. Vectors of any other length are rejected.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenizerConfig {
    #[serde(default = "default_tokenizer_kind")]
    pub kind: String,
    /// Path to a `tokenizer.json` for the `huggingface` kind.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: default_tokenizer_kind(),
            path: None,
        }
    }
}

fn default_tokenizer_kind() -> String {
    "estimate".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Tokens kept free for the model's answer.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_model_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            name: None,
            url: None,
            context_window: default_context_window(),
            reserve_tokens: default_reserve_tokens(),
            temperature: default_temperature(),
            top_k: default_model_top_k(),
            top_p: default_top_p(),
            max_new_tokens: default_max_new_tokens(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_context_window() -> usize {
    4096
}
fn default_reserve_tokens() -> usize {
    512
}
fn default_temperature() -> f64 {
    0.9
}
fn default_model_top_k() -> u32 {
    50
}
fn default_top_p() -> f64 {
    0.95
}
fn default_max_new_tokens() -> u32 {
    128
}
fn default_generation_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default = "default_system_prompt_file")]
    pub system_prompt_file: PathBuf,
    #[serde(default)]
    pub autosave: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            system_prompt_file: default_system_prompt_file(),
            autosave: false,
        }
    }
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("./chats")
}
fn default_system_prompt_file() -> PathBuf {
    PathBuf::from("./prompts/system.md")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    // Validate retrieval
    let fraction = config.retrieval.context_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
        bail!("retrieval.context_fraction must be in (0.0, 1.0]");
    }
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0 when set");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate tokenizer
    match config.tokenizer.kind.as_str() {
        "estimate" => {}
        "huggingface" => {
            if config.tokenizer.path.is_none() {
                bail!("tokenizer.path must be specified when kind is 'huggingface'");
            }
        }
        other => bail!(
            "Unknown tokenizer kind: '{}'. Must be estimate or huggingface.",
            other
        ),
    }

    // Validate model
    if config.model.context_window == 0 {
        bail!("model.context_window must be > 0");
    }
    if config.model.reserve_tokens >= config.model.context_window {
        bail!(
            "model.reserve_tokens ({}) must be smaller than model.context_window ({})",
            config.model.reserve_tokens,
            config.model.context_window
        );
    }
    match config.model.provider.as_str() {
        "disabled" => {}
        "ollama" => {
            if config.model.name.is_none() {
                bail!("model.name must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown model provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    Ok(())
}
