//! System prompt loading.

use std::path::Path;
use tracing::{debug, warn};

/// Used when no prompt file is configured, present, or non-empty.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Keep your answers brief and concise. Do not ramble.";

/// Load the system prompt from `path`, trimmed.
///
/// Falls back to [`DEFAULT_SYSTEM_PROMPT`] when the file is missing,
/// unreadable, or blank.
pub fn load_system_prompt(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => {
            debug!(path = %path.display(), "loaded system prompt");
            text.trim().to_string()
        }
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "system prompt unreadable; using default");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_default() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            load_system_prompt(&tmp.path().join("system.md")),
            DEFAULT_SYSTEM_PROMPT
        );
    }

    #[test]
    fn test_blank_file_uses_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("system.md");
        std::fs::write(&path, "  \n\n").unwrap();
        assert_eq!(load_system_prompt(&path), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_file_is_trimmed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("system.md");
        std::fs::write(&path, "\nYou are a pirate.\n").unwrap();
        assert_eq!(load_system_prompt(&path), "You are a pirate.");
    }
}
