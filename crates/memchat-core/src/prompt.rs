//! Token-budgeted prompt assembly.
//!
//! Splits the model's context window between the system prompt, retrieved
//! memory context, and chat history, in that priority order, and produces the
//! final ordered message list for one turn.
//!
//! # Budget
//!
//! ```text
//! window = margin + system + rag + history + current turn + cue
//! ```
//!
//! - The system prompt, the current user turn and the assistant cue are
//!   mandatory and never trimmed.
//! - RAG context gets at most `rag_fraction × window`, and never more than
//!   what is left once the mandatory parts and the safety margin are paid.
//! - History takes whatever remains, filled backward from the newest message.
//!   The first message that does not fit ends the fill.
//! - If the mandatory parts fit the window but not the margin, the margin is
//!   given up and both RAG and history are empty.
//! - If the mandatory parts alone exceed the window, assembly fails.
//!
//! Every part is measured in its rendered form, so the sum of the parts is
//! the token count of [`AssembledPrompt::render`] for any tokenizer whose
//! counts are additive across concatenation.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::index::RetrievalResult;
use crate::models::{ChatMessage, Role};
use crate::tokenizer::Tokenizer;

/// Generation cue appended after the last message.
pub const ASSISTANT_CUE: &str = "<|assistant|>\n";

/// Default share of the window available to retrieved context.
pub const DEFAULT_RAG_FRACTION: f64 = 0.25;

/// Render one message in the plain-text chat layout.
pub fn render_message(message: &ChatMessage) -> String {
    format!("<|{}|>\n{}</s>\n", message.role.as_str(), message.content)
}

/// Wrap retrieved context in the system message injected after the system
/// prompt.
pub fn context_message(context: &str) -> ChatMessage {
    ChatMessage::system(format!(
        "# Knowledge Base Context\n\n{}\n\n---\n\nUse the above context to help answer questions when relevant.",
        context
    ))
}

/// Window size and split ratios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetConfig {
    /// Total context window of the model, in tokens.
    pub context_window: usize,
    /// Maximum share of the window for retrieved context, in `(0, 1]`.
    pub rag_fraction: f64,
    /// Tokens held back as a safety margin (room for generation).
    pub reserve_tokens: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            context_window: 4096,
            rag_fraction: DEFAULT_RAG_FRACTION,
            reserve_tokens: 512,
        }
    }
}

impl BudgetConfig {
    /// Upper bound on RAG tokens regardless of what else is in the prompt.
    pub fn rag_cap(&self) -> usize {
        (self.context_window as f64 * self.rag_fraction).floor() as usize
    }
}

/// Tokens spent on each part of an assembled prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub window: usize,
    /// Margin actually kept free. Smaller than configured when sacrificed.
    pub reserve: usize,
    pub system: usize,
    pub rag: usize,
    pub history: usize,
    pub current_turn: usize,
    pub cue: usize,
}

impl TokenUsage {
    /// Tokens used by the prompt itself.
    pub fn total(&self) -> usize {
        self.system + self.rag + self.history + self.current_turn + self.cue
    }
}

/// Final prompt for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    /// System prompt, context block, surviving history, then the user turn.
    pub messages: Vec<ChatMessage>,
    pub usage: TokenUsage,
    /// Retrieved chunks that made it into the context block.
    pub rag: RetrievalResult,
    pub history_kept: usize,
    pub history_dropped: usize,
}

impl AssembledPrompt {
    /// Plain-text rendering ending with the assistant cue.
    pub fn render(&self) -> String {
        let mut out: String = self.messages.iter().map(render_message).collect();
        out.push_str(ASSISTANT_CUE);
        out
    }
}

/// Token counts of the parts that are never trimmed.
struct Mandatory {
    system: usize,
    current_turn: usize,
    cue: usize,
}

impl Mandatory {
    fn total(&self) -> usize {
        self.system + self.current_turn + self.cue
    }
}

/// Builds prompts inside a fixed token window.
pub struct PromptAssembler {
    config: BudgetConfig,
    tokenizer: Arc<dyn Tokenizer>,
}

impl PromptAssembler {
    pub fn new(config: BudgetConfig, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { config, tokenizer }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    fn count(&self, message: &ChatMessage) -> usize {
        self.tokenizer.count_tokens(&render_message(message))
    }

    fn mandatory(&self, system_prompt: &str, user_turn: &str) -> Mandatory {
        let system = if system_prompt.trim().is_empty() {
            0
        } else {
            self.count(&ChatMessage::system(system_prompt))
        };
        Mandatory {
            system,
            current_turn: self.count(&ChatMessage::user(user_turn)),
            cue: self.tokenizer.count_tokens(ASSISTANT_CUE),
        }
    }

    /// Room for the rendered context block: capped by the fraction and by
    /// what the mandatory parts and margin leave over.
    fn rag_allocation(&self, mandatory: &Mandatory) -> usize {
        let available = self
            .config
            .context_window
            .saturating_sub(self.config.reserve_tokens)
            .saturating_sub(mandatory.total());
        self.config.rag_cap().min(available)
    }

    /// Token budget to pass to retrieval for this turn.
    ///
    /// This is the RAG allocation minus the fixed overhead of the context
    /// wrapper. Zero when nothing can be retrieved.
    pub fn retrieval_budget(&self, system_prompt: &str, user_turn: &str) -> usize {
        let mandatory = self.mandatory(system_prompt, user_turn);
        let overhead = self.count(&context_message(""));
        self.rag_allocation(&mandatory).saturating_sub(overhead)
    }

    /// Assemble the prompt for one turn.
    ///
    /// `retrieval` is ranked best first; its lowest-ranked chunks are dropped
    /// if the rendered block overruns the allocation. `history` is in
    /// chronological order and must not contain the current turn.
    pub fn assemble(
        &self,
        system_prompt: &str,
        mut retrieval: RetrievalResult,
        history: &[ChatMessage],
        user_turn: &str,
    ) -> Result<AssembledPrompt> {
        let window = self.config.context_window;
        let mandatory = self.mandatory(system_prompt, user_turn);

        if mandatory.total() > window {
            bail!(
                "prompt does not fit the context window: system prompt and current message need {} tokens, window is {}",
                mandatory.total(),
                window
            );
        }

        let reserve = self.config.reserve_tokens.min(window - mandatory.total());
        let allocation = self.rag_allocation(&mandatory);

        // Joins and the wrapper are measured on the rendered block.
        let mut rag_block = None;
        let mut rag_tokens = 0;
        while !retrieval.is_empty() {
            let block = context_message(&retrieval.context_text());
            let tokens = self.count(&block);
            if tokens <= allocation {
                rag_block = Some(block);
                rag_tokens = tokens;
                break;
            }
            retrieval.pop_last();
        }

        let mut remaining = window - reserve - mandatory.total() - rag_tokens;
        let mut kept = Vec::new();
        let mut history_tokens = 0;
        for message in history.iter().rev() {
            if message.role == Role::System {
                continue;
            }
            let tokens = self.count(message);
            if tokens > remaining {
                break;
            }
            remaining -= tokens;
            history_tokens += tokens;
            kept.push(message.clone());
        }
        kept.reverse();

        let conversational = history.iter().filter(|m| m.role != Role::System).count();
        let history_kept = kept.len();

        let mut messages = Vec::with_capacity(kept.len() + 3);
        if mandatory.system > 0 {
            messages.push(ChatMessage::system(system_prompt));
        }
        if let Some(block) = rag_block {
            messages.push(block);
        }
        messages.extend(kept);
        messages.push(ChatMessage::user(user_turn));

        Ok(AssembledPrompt {
            messages,
            usage: TokenUsage {
                window,
                reserve,
                system: mandatory.system,
                rag: rag_tokens,
                history: history_tokens,
                current_turn: mandatory.current_turn,
                cue: mandatory.cue,
            },
            rag: retrieval,
            history_kept,
            history_dropped: conversational - history_kept,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::RetrievedChunk;
    use crate::models::Chunk;
    use crate::tokenizer::EstimateTokenizer;

    /// One token per whitespace-separated word. Additive enough for exact
    /// assertions on small prompts.
    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn assembler(window: usize, fraction: f64, reserve: usize) -> PromptAssembler {
        PromptAssembler::new(
            BudgetConfig {
                context_window: window,
                rag_fraction: fraction,
                reserve_tokens: reserve,
            },
            Arc::new(EstimateTokenizer),
        )
    }

    fn retrieval(texts: &[&str]) -> RetrievalResult {
        let mut r = RetrievalResult::default();
        for (i, t) in texts.iter().enumerate() {
            let tokens = EstimateTokenizer.count_tokens(t);
            r.total_tokens += tokens;
            r.items.push(RetrievedChunk {
                chunk: Chunk {
                    source: "m.md".into(),
                    index: i,
                    text: t.to_string(),
                    token_estimate: tokens,
                },
                score: 1.0 - i as f32 * 0.1,
                tokens,
            });
        }
        r
    }

    fn history(n: usize, len: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let body = format!("{} {}", i, "h".repeat(len));
                if i % 2 == 0 {
                    ChatMessage::user(body)
                } else {
                    ChatMessage::assistant(body)
                }
            })
            .collect()
    }

    #[test]
    fn test_order_and_roles() {
        let a = assembler(4096, 0.25, 512);
        let hist = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let p = a
            .assemble("Be brief.", retrieval(&["fact one"]), &hist, "question?")
            .unwrap();

        assert_eq!(p.messages.len(), 5);
        assert_eq!(p.messages[0], ChatMessage::system("Be brief."));
        assert_eq!(p.messages[1].role, Role::System);
        assert!(p.messages[1].content.starts_with("# Knowledge Base Context"));
        assert!(p.messages[1].content.contains("fact one"));
        assert_eq!(p.messages[2].content, "hi");
        assert_eq!(p.messages[3].content, "hello");
        assert_eq!(p.messages[4], ChatMessage::user("question?"));
        assert!(p.render().ends_with(ASSISTANT_CUE));
        assert_eq!(p.history_kept, 2);
        assert_eq!(p.history_dropped, 0);
    }

    #[test]
    fn test_render_layout() {
        let a = assembler(4096, 0.25, 0);
        let p = a
            .assemble("sys", RetrievalResult::empty(), &[], "hi")
            .unwrap();
        assert_eq!(
            p.render(),
            "<|system|>\nsys</s>\n<|user|>\nhi</s>\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_empty_system_prompt_omitted() {
        let a = assembler(4096, 0.25, 512);
        let p = a.assemble("  ", RetrievalResult::empty(), &[], "q").unwrap();
        assert_eq!(p.messages, vec![ChatMessage::user("q")]);
        assert_eq!(p.usage.system, 0);
    }

    #[test]
    fn test_no_context_block_without_chunks() {
        let a = assembler(4096, 0.25, 512);
        let p = a.assemble("sys", RetrievalResult::empty(), &[], "q").unwrap();
        assert_eq!(p.messages.len(), 2);
        assert_eq!(p.usage.rag, 0);
    }

    #[test]
    fn test_history_trimmed_oldest_first() {
        let a = assembler(400, 0.25, 100);
        // Each message renders to ~50 tokens; only a few fit.
        let hist = history(12, 180);
        let p = a
            .assemble("sys", RetrievalResult::empty(), &hist, "latest")
            .unwrap();

        assert!(p.history_kept > 0);
        assert!(p.history_kept < hist.len());
        assert_eq!(p.history_kept + p.history_dropped, hist.len());
        // Survivors are the newest messages, in chronological order.
        let survivors = &p.messages[1..p.messages.len() - 1];
        assert_eq!(survivors, &hist[hist.len() - p.history_kept..]);
    }

    #[test]
    fn test_history_stops_at_first_overflow() {
        let a = PromptAssembler::new(
            BudgetConfig {
                context_window: 40,
                rag_fraction: 0.25,
                reserve_tokens: 0,
            },
            Arc::new(WordTokenizer),
        );
        let hist = vec![
            ChatMessage::user("tiny"),
            ChatMessage::assistant(vec!["w"; 40].join(" ")),
            ChatMessage::user("small"),
        ];
        let p = a.assemble("", RetrievalResult::empty(), &hist, "q").unwrap();
        // The 40-word message does not fit, so "tiny" behind it is dropped too.
        assert_eq!(p.history_kept, 1);
        assert_eq!(p.messages[0].content, "small");
    }

    #[test]
    fn test_rag_capped_by_fraction() {
        let a = assembler(1000, 0.1, 0);
        let chunks: Vec<String> = (0..20).map(|i| format!("{} {}", i, "x".repeat(60))).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let budget = a.retrieval_budget("sys", "q");
        assert!(budget < 100);
        let p = a.assemble("sys", retrieval(&refs), &[], "q").unwrap();
        assert!(p.usage.rag <= 100);
        assert!(!p.rag.is_empty());
        assert!(p.rag.len() < 20);
        // Best-ranked chunks survive.
        assert_eq!(p.rag.items[0].chunk.index, 0);
    }

    #[test]
    fn test_rag_block_pops_lowest_ranked() {
        let a = assembler(400, 0.25, 0);
        let p = a
            .assemble(
                "",
                retrieval(&[&"a".repeat(200), &"b".repeat(200), &"c".repeat(200)]),
                &[],
                "q",
            )
            .unwrap();
        assert_eq!(p.rag.len(), 1);
        assert!(p.messages[0].content.contains(&"a".repeat(200)));
        assert!(!p.messages[0].content.contains("bbbb"));
    }

    #[test]
    fn test_rag_never_in_history_slot() {
        let a = assembler(4096, 0.25, 512);
        let hist = vec![ChatMessage::system("old system"), ChatMessage::user("u")];
        let p = a.assemble("sys", RetrievalResult::empty(), &hist, "q").unwrap();
        assert_eq!(p.messages.len(), 3);
        assert!(!p.messages.iter().any(|m| m.content == "old system"));
    }

    #[test]
    fn test_margin_sacrificed_when_mandatory_barely_fits() {
        let a = assembler(100, 0.25, 80);
        let user = "u".repeat(300);
        let p = a
            .assemble("sys", retrieval(&["fact"]), &history(4, 10), &user)
            .unwrap();
        assert!(p.usage.total() <= 100);
        assert!(p.usage.reserve < 80);
        assert_eq!(p.usage.rag, 0);
        assert_eq!(p.history_kept, 0);
        assert_eq!(p.messages.len(), 2);
    }

    #[test]
    fn test_mandatory_overflow_is_error() {
        let a = assembler(50, 0.25, 0);
        let user = "u".repeat(1000);
        assert!(a
            .assemble("sys", RetrievalResult::empty(), &[], &user)
            .is_err());
        assert_eq!(a.retrieval_budget("sys", &user), 0);
    }

    #[test]
    fn test_rendered_prompt_within_window() {
        for window in [64, 128, 300, 1024, 4096] {
            for reserve in [0, 16, 200] {
                if reserve >= window {
                    continue;
                }
                let a = assembler(window, 0.25, reserve);
                let chunk_a = "alpha ".repeat(40);
                let chunk_b = "beta ".repeat(30);
                let hist = history(30, 40);
                let Ok(p) = a.assemble(
                    "You are a helpful assistant.",
                    retrieval(&[&chunk_a, &chunk_b]),
                    &hist,
                    "What do penguins eat?",
                ) else {
                    continue;
                };
                let rendered = EstimateTokenizer.count_tokens(&p.render());
                assert!(rendered <= window, "window {} got {}", window, rendered);
                assert!(p.usage.total() + p.usage.reserve <= window);
            }
        }
    }

    #[test]
    fn test_usage_sums_to_rendered_count() {
        let a = PromptAssembler::new(BudgetConfig::default(), Arc::new(WordTokenizer));
        let hist = vec![ChatMessage::user("one two"), ChatMessage::assistant("three")];
        let p = a
            .assemble("sys prompt", RetrievalResult::empty(), &hist, "four five six")
            .unwrap();
        assert_eq!(p.usage.total(), WordTokenizer.count_tokens(&p.render()));
    }

    #[test]
    fn test_rag_cap() {
        assert_eq!(BudgetConfig::default().rag_cap(), 1024);
    }
}
