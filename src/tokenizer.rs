//! Tokenizer selection.
//!
//! The prompt budget is only as accurate as the token counts behind it.
//! `estimate` (the default) needs nothing but over-counts slightly;
//! `huggingface` loads the model's own `tokenizer.json` for exact counts and
//! requires the `hf-tokenizer` feature.

use anyhow::{bail, Result};
use std::sync::Arc;

pub use memchat_core::tokenizer::{EstimateTokenizer, Tokenizer};

use crate::config::TokenizerConfig;

/// Exact token counts from a Hugging Face `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e)
        })?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer failed; falling back to estimate");
                memchat_core::chunk::estimate_tokens(text)
            }
        }
    }
}

/// Create the [`Tokenizer`] named by `config.kind`.
pub fn create_tokenizer(config: &TokenizerConfig) -> Result<Arc<dyn Tokenizer>> {
    match config.kind.as_str() {
        "estimate" => Ok(Arc::new(EstimateTokenizer)),
        #[cfg(feature = "hf-tokenizer")]
        "huggingface" => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("tokenizer.path required for huggingface"))?;
            Ok(Arc::new(HfTokenizer::from_file(path)?))
        }
        #[cfg(not(feature = "hf-tokenizer"))]
        "huggingface" => bail!("Hugging Face tokenizer requires --features hf-tokenizer"),
        other => bail!("Unknown tokenizer kind: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_estimate() {
        let tokenizer = create_tokenizer(&TokenizerConfig::default()).unwrap();
        assert_eq!(tokenizer.count_tokens("abcdefgh"), 2);
    }

    #[test]
    fn test_unknown_kind() {
        let config = TokenizerConfig {
            kind: "tiktoken".into(),
            path: None,
        };
        assert!(create_tokenizer(&config).is_err());
    }
}
