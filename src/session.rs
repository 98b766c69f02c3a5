//! One chat conversation.
//!
//! [`ChatSession`] ties retrieval and prompt assembly together for each
//! turn and owns the conversation history. Retrieved context only ever
//! lives inside the prompt of the turn it was retrieved for.

use anyhow::Result;
use tracing::debug;

use memchat_core::index::RetrievalResult;
use memchat_core::models::{ChatMessage, Role};
use memchat_core::prompt::{AssembledPrompt, PromptAssembler};

use crate::rag::RagManager;

pub struct ChatSession {
    rag: Option<RagManager>,
    assembler: PromptAssembler,
    system_prompt: String,
    history: Vec<ChatMessage>,
}

impl ChatSession {
    /// `rag` is `None` when retrieval is turned off.
    pub fn new(
        assembler: PromptAssembler,
        system_prompt: impl Into<String>,
        rag: Option<RagManager>,
    ) -> Self {
        Self {
            rag,
            assembler,
            system_prompt: system_prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn rag(&self) -> Option<&RagManager> {
        self.rag.as_ref()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Replace the history, e.g. with a loaded conversation. System
    /// messages are dropped; the session's own system prompt applies.
    pub fn set_history(&mut self, messages: Vec<ChatMessage>) {
        self.history = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .collect();
    }

    /// Retrieve context for `user_input` and assemble the prompt.
    ///
    /// Fails only when the system prompt and the message alone do not fit
    /// the context window.
    pub async fn prepare_turn(&self, user_input: &str) -> Result<AssembledPrompt> {
        let budget = self
            .assembler
            .retrieval_budget(&self.system_prompt, user_input);

        let retrieval = match &self.rag {
            Some(rag) => rag.retrieve(user_input, budget).await,
            None => RetrievalResult::empty(),
        };

        let prompt =
            self.assembler
                .assemble(&self.system_prompt, retrieval, &self.history, user_input)?;
        debug!(
            budget,
            rag_tokens = prompt.usage.rag,
            history_kept = prompt.history_kept,
            history_dropped = prompt.history_dropped,
            total = prompt.usage.total(),
            "assembled prompt"
        );
        Ok(prompt)
    }

    /// Append a completed exchange to the history.
    pub fn record_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.history.push(ChatMessage::user(user));
        self.history.push(ChatMessage::assistant(assistant));
    }

    /// System prompt followed by the history, as saved to disk.
    pub fn transcript(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }
}
