//! Response generation.
//!
//! A [`Generator`] turns an assembled prompt into the assistant's reply,
//! streaming fragments through a callback as they arrive.
//!
//! - **[`OllamaGenerator`]**: `POST /api/chat` on a local Ollama instance,
//!   consuming the newline-delimited JSON stream.
//! - **[`DisabledGenerator`]**: returns errors; used when no model is
//!   configured (retrieval and prompt assembly still work).

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use memchat_core::prompt::AssembledPrompt;

use crate::config::ModelConfig;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier shown to the user.
    fn model_name(&self) -> &str;

    /// Generate a reply to `prompt`, passing each fragment to `on_token`.
    ///
    /// Returns the full reply.
    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String>;
}

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _prompt: &AssembledPrompt,
        _on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        bail!("No generation model configured (set [model] provider = \"ollama\")")
    }
}

/// Chat completion through a local Ollama instance.
pub struct OllamaGenerator {
    model: String,
    url: String,
    options: serde_json::Value,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let model = config
            .name
            .clone()
            .ok_or_else(|| anyhow!("model.name required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            options: serde_json::json!({
                "temperature": config.temperature,
                "top_k": config.top_k,
                "top_p": config.top_p,
                "num_predict": config.max_new_tokens,
                "num_ctx": config.context_window,
            }),
            client,
        })
    }

    fn request_body(&self, prompt: &AssembledPrompt) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": prompt.messages,
            "stream": true,
            "options": self.options,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &AssembledPrompt,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String> {
        let mut response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&self.request_body(prompt))
            .send()
            .await
            .with_context(|| format!("Ollama connection error (is Ollama running at {}?)", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let mut stream = ChatStream::default();
        while let Some(bytes) = response.chunk().await? {
            stream.feed(&bytes, on_token)?;
            if stream.done {
                break;
            }
        }
        stream.finish(on_token)?;
        Ok(stream.reply)
    }
}

/// Callback receiving streamed reply fragments.
type TokenSink<'s> = dyn for<'a> FnMut(&'a str) + Send + 's;

/// Incremental parser for Ollama's NDJSON chat stream.
#[derive(Default)]
struct ChatStream {
    pending: Vec<u8>,
    reply: String,
    done: bool,
}

impl ChatStream {
    fn feed(&mut self, bytes: &[u8], on_token: &mut TokenSink<'_>) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.line(&line, on_token)?;
        }
        Ok(())
    }

    fn finish(&mut self, on_token: &mut TokenSink<'_>) -> Result<()> {
        let rest = std::mem::take(&mut self.pending);
        self.line(&rest, on_token)
    }

    fn line(&mut self, line: &[u8], on_token: &mut TokenSink<'_>) -> Result<()> {
        let text = std::str::from_utf8(line).context("Invalid UTF-8 in Ollama stream")?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let json: serde_json::Value =
            serde_json::from_str(text).context("Invalid JSON in Ollama stream")?;

        if let Some(error) = json.get("error").and_then(|e| e.as_str()) {
            bail!("Ollama error: {}", error);
        }
        if let Some(content) = json
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
        {
            if !content.is_empty() {
                on_token(content);
                self.reply.push_str(content);
            }
        }
        if json.get("done").and_then(|d| d.as_bool()) == Some(true) {
            self.done = true;
        }
        Ok(())
    }
}

/// Create the [`Generator`] named by `config.provider`.
pub fn create_generator(config: &ModelConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}
