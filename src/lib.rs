//! # memchat
//!
//! A local terminal chat client that answers from your own notes.
//!
//! Text files in a memory directory are chunked and embedded once (cached on
//! disk by modification time). Each user turn retrieves the most similar
//! chunks and a token-budgeted prompt is assembled from the system prompt,
//! the retrieved context, as much recent history as fits, and the message.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ memory dir   │──▶│ chunk + embed │──▶│ cache (JSON)  │
//! │ *.md, *.txt  │   │  (providers)  │   └──────┬────────┘
//! └──────────────┘   └───────────────┘          │
//!                                               ▼
//!  user turn ──▶ retrieve (cosine, budget) ──▶ assemble ──▶ generate
//!                                               ▲
//!                                     history ──┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memchat index                       # build the memory index
//! memchat search "penguin diet"       # inspect retrieval
//! memchat prompt "What do penguins eat?"
//! memchat chat                        # talk
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`memory`] | Memory directory scanning |
//! | [`cache`] | Persistent embedding cache |
//! | [`embedding`] | Embedding providers |
//! | [`tokenizer`] | Tokenizer selection |
//! | [`rag`] | Index build and retrieval |
//! | [`session`] | Per-turn retrieval and prompt assembly |
//! | [`generate`] | Streaming generation |
//! | [`chat`] | Interactive loop |
//! | [`history`] | Saved conversations |
//!
//! Chunking, ranking and the prompt budget live in the I/O-free
//! `memchat-core` crate.

pub mod atomic;
pub mod cache;
pub mod chat;
pub mod config;
pub mod embedding;
pub mod generate;
pub mod history;
pub mod index_cmd;
pub mod memory;
pub mod progress;
pub mod prompt_cmd;
pub mod rag;
pub mod search;
pub mod session;
pub mod system_prompt;
pub mod tokenizer;
