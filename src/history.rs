//! Saved conversations.
//!
//! Each conversation is a pretty-printed JSON array of messages in
//! `chat.history_dir`:
//!
//! ```json
//! [
//!   { "role": "user", "content": "What do penguins eat?" },
//!   { "role": "assistant", "content": "Mostly krill and small fish." }
//! ]
//! ```
//!
//! Unnamed saves get a timestamped file name (`chat_YYYYMMDD_HHMMSS.json`).
//! Retrieved memory context is never part of a saved conversation.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};

use memchat_core::models::{ChatMessage, Role};

use crate::atomic::write_atomic;
use crate::config::ChatConfig;

/// A saved conversation on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedChat {
    /// File name including `.json`.
    pub name: String,
    pub modified: DateTime<Utc>,
}

pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `messages` under `name`, or a fresh timestamped name.
    ///
    /// Returns the file name used. Names are plain file names; anything
    /// that would leave the history directory is rejected.
    pub fn save(&self, messages: &[ChatMessage], name: Option<&str>) -> Result<String> {
        let name = match name {
            Some(name) => chat_file_name(name)?,
            None => format!("chat_{}.json", Local::now().format("%Y%m%d_%H%M%S")),
        };
        let data = serde_json::to_vec_pretty(messages).context("Failed to serialize chat")?;
        write_atomic(&self.dir.join(&name), &data)
            .with_context(|| format!("Failed to save chat {}", name))?;
        Ok(name)
    }

    /// Load a saved conversation, dropping any system messages.
    pub fn load(&self, name: &str) -> Result<Vec<ChatMessage>> {
        read_chat_file(&self.dir.join(chat_file_name(name)?))
    }

    /// Saved conversations, newest first. Empty when the directory is missing.
    pub fn list(&self) -> Result<Vec<SavedChat>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to list chat directory: {}", self.dir.display())
                })
            }
        };

        let mut chats = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            chats.push(SavedChat {
                name,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        chats.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(chats)
    }
}

/// Read a conversation file from any path, dropping system messages.
pub fn read_chat_file(path: &Path) -> Result<Vec<ChatMessage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chat file: {}", path.display()))?;
    let messages: Vec<ChatMessage> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid chat file: {}", path.display()))?;

    Ok(messages
        .into_iter()
        .filter(|m| m.role != Role::System)
        .collect())
}

/// Run the `chats` command: list saved conversations, newest first.
pub fn run_list_chats(config: &ChatConfig) -> Result<()> {
    let chats = ChatStore::new(&config.history_dir).list()?;
    if chats.is_empty() {
        println!("No saved chats in {}.", config.history_dir.display());
        return Ok(());
    }
    for chat in chats {
        println!(
            "{}  {}",
            chat.modified
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M"),
            chat.name
        );
    }
    Ok(())
}

/// `name` with a `.json` extension, if it is a plain file name.
fn chat_file_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." || name.chars().any(std::path::is_separator)
    {
        bail!("Invalid chat name {:?}: use a plain file name", name);
    }
    if name.ends_with(".json") {
        Ok(name.to_string())
    } else {
        Ok(format!("{}.json", name))
    }
}
