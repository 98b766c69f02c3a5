//! Token counting capability.

use crate::chunk::estimate_tokens;

/// Maps text to a token count.
///
/// Used for the exact accounting in retrieval budgets and prompt assembly.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Dependency-free tokenizer that counts one token per four characters.
///
/// Overestimates slightly for English prose, which keeps assembled prompts
/// inside the context window when no model tokenizer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenizer;

impl Tokenizer for EstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}
