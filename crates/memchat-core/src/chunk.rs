//! Boundary-aware text chunker.
//!
//! Splits a memory file into [`Chunk`]s of at most `max_chars` characters,
//! cutting at the most structural boundary available inside each window.
//!
//! # Algorithm
//!
//! 1. Take the next `max_chars` characters after the previous cut as the window.
//! 2. If the rest of the text fits in the window, it becomes the final chunk.
//! 3. Otherwise cut after the last paragraph break (`\n\n`) in the window,
//!    else the last line break, else the last sentence end (`. `, `! `, `? `),
//!    else the last whitespace.
//! 4. If the window contains no whitespace at all, extend the cut forward to
//!    the end of the current word. Words are never split, so a single word
//!    longer than `max_chars` becomes one oversized chunk.
//! 5. Trim each piece at its cut points and drop pieces that are only
//!    whitespace.
//!
//! Chunks never overlap, and the word sequence of the concatenated chunks is
//! the word sequence of the input.
//!
//! # Example
//!
//! ```rust
//! use memchat_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("notes.md", "Hello world.\n\nSecond paragraph.", 800);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
///
/// Used for the chunk size heuristic and for [`Chunk::token_estimate`].
/// Budgeting always uses an exact count from a
/// [`Tokenizer`](crate::tokenizer::Tokenizer).
pub const CHARS_PER_TOKEN: usize = 4;

/// Default chunk ceiling: 800 characters, roughly 200 tokens.
pub const DEFAULT_MAX_CHARS: usize = 800;

const SENTENCE_ENDS: [&str; 3] = [". ", "! ", "? "];

/// Rough token estimate for `text` (characters / 4, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// `source` is recorded on every chunk as the owning file identity.
/// Returns an empty vector for empty or whitespace-only input. Indices are
/// contiguous from 0.
pub fn chunk_text(source: &str, text: &str, max_chars: usize) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let rest = &text[start..];
        let window_end = byte_offset_of_char(rest, max_chars);
        let cut = if window_end == rest.len() {
            rest.len()
        } else {
            find_cut(rest, window_end)
        };

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(source, chunks.len(), piece));
        }
        start += cut;
    }

    chunks
}

/// Byte offset of the `n`-th character of `s`, or `s.len()` if shorter.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Pick the cut position for a window `rest[..window_end]`.
///
/// The returned offset is always greater than zero, so the scan advances.
fn find_cut(rest: &str, window_end: usize) -> usize {
    let window = &rest[..window_end];

    if let Some(pos) = window.rfind("\n\n") {
        return pos + 2;
    }
    if let Some(pos) = window.rfind('\n') {
        return pos + 1;
    }
    if let Some(pos) = SENTENCE_ENDS.iter().filter_map(|p| window.rfind(p)).max() {
        return pos + 2;
    }

    // A word that ends exactly at the ceiling is a valid boundary.
    if rest[window_end..].starts_with(char::is_whitespace) {
        return window_end;
    }
    if let Some((pos, ch)) = window
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
    {
        return pos + ch.len_utf8();
    }

    // Single word longer than the ceiling: keep it whole.
    rest[window_end..]
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, _)| window_end + i)
        .unwrap_or(rest.len())
}

fn make_chunk(source: &str, index: usize, text: &str) -> Chunk {
    Chunk {
        source: source.to_string(),
        index,
        text: text.to_string(),
        token_estimate: estimate_tokens(text),
    }
}
