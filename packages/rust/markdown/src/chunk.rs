//! Token-bounded markdown chunking.
//!
//! Text is cut into blocks at blank lines outside code fences, so paragraphs,
//! tables and fenced code stay whole. Blocks are packed greedily into chunks.
//! A block larger than the limit falls back to line boundaries, and a line
//! larger than the limit is hard-split on char boundaries.

use tracing::debug;

use crate::tokens::TokenCounter;

/// One sequential slice of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in the chunk sequence, from 0.
    pub index: usize,
    pub text: String,
    pub tokens: usize,
}

/// Split `text` into ordered chunks of at most `max_tokens` tokens each.
///
/// Concatenating the chunk texts reproduces `text` exactly.
pub fn chunk_markdown(counter: &dyn TokenCounter, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_tokens = max_tokens.max(1);
    let mut pieces: Vec<(&str, usize)> = Vec::new();

    for block in split_blocks(text) {
        let tokens = counter.count(block);
        if tokens <= max_tokens {
            pieces.push((block, tokens));
            continue;
        }
        for line in block.split_inclusive('\n') {
            let tokens = counter.count(line);
            if tokens <= max_tokens {
                pieces.push((line, tokens));
            } else {
                pieces.extend(hard_split(counter, line, max_tokens));
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for (piece, tokens) in pieces {
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            push_chunk(counter, &mut chunks, std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push_str(piece);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        push_chunk(counter, &mut chunks, current);
    }

    debug!(chunks = chunks.len(), max_tokens, "chunked markdown");
    chunks
}

fn push_chunk(counter: &dyn TokenCounter, chunks: &mut Vec<Chunk>, text: String) {
    let tokens = counter.count(&text);
    chunks.push(Chunk {
        index: chunks.len(),
        text,
        tokens,
    });
}

/// Block slices of `text`. Trailing blank lines stay attached to their block.
fn split_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut start = 0usize;
    let mut offset = 0usize;
    let mut in_fence = false;
    let mut prev_blank = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if !in_fence && !blank && prev_blank && offset > start {
            blocks.push(&text[start..offset]);
            start = offset;
        }
        if is_fence(line) {
            in_fence = !in_fence;
        }
        prev_blank = blank && !in_fence;
        offset += line.len();
    }
    if offset > start {
        blocks.push(&text[start..offset]);
    }
    blocks
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn hard_split<'a>(
    counter: &dyn TokenCounter,
    line: &'a str,
    max_tokens: usize,
) -> Vec<(&'a str, usize)> {
    let mut out = Vec::new();
    let mut rest = line;

    while !rest.is_empty() {
        let mut take = max_tokens;
        loop {
            let end = rest
                .char_indices()
                .nth(take)
                .map_or(rest.len(), |(i, _)| i);
            let slice = &rest[..end];
            let tokens = counter.count(slice);
            if tokens <= max_tokens || take == 1 {
                out.push((slice, tokens));
                rest = &rest[end..];
                break;
            }
            take = (take / 2).max(1);
        }
    }
    out
}
