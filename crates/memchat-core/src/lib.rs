//! # memchat core
//!
//! Pure logic shared by the `memchat` client: data models, boundary-aware
//! chunking, the embedding and tokenizer capability traits, the in-memory
//! similarity index, and the token-budgeted prompt assembler.
//!
//! This crate performs no filesystem or network I/O and pulls in no async
//! runtime. Everything that touches disk, HTTP, or a model lives in the
//! `memchat` app crate.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
pub mod prompt;
pub mod tokenizer;
