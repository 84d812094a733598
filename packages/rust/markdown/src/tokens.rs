//! Token estimation and token-boundary truncation.

/// Counts model tokens in a text.
///
/// Implementations must be subadditive: `count(a + b) <= count(a) + count(b)`.
/// The chunker relies on this to pack pieces by summing their counts.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Tokenizer-free estimate: four ASCII characters per token, one token per
/// non-ASCII character (CJK text tokenizes close to one token per glyph).
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatingCounter;

impl TokenCounter for EstimatingCounter {
    fn count(&self, text: &str) -> usize {
        let mut ascii = 0usize;
        let mut other = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii += 1;
            } else {
                other += 1;
            }
        }
        ascii.div_ceil(4) + other
    }
}

/// Cut `text` to at most `limit` tokens.
///
/// Returns the (possibly shortened) text and whether anything was cut. The cut
/// lands on a char boundary and backs off to the last whitespace when one is
/// close to the end.
pub fn truncate_to_tokens(counter: &dyn TokenCounter, text: &str, limit: usize) -> (String, bool) {
    if counter.count(text) <= limit {
        return (text.to_string(), false);
    }
    if limit == 0 {
        return (String::new(), true);
    }

    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    // Largest prefix (in chars) that fits.
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if counter.count(&text[..boundaries[mid]]) <= limit {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let prefix = &text[..boundaries[lo]];
    let cut = match prefix.rfind(char::is_whitespace) {
        Some(ws) if ws > 0 && ws >= prefix.len() - prefix.len() / 10 => &prefix[..ws],
        _ => prefix,
    };

    (cut.trim_end().to_string(), true)
}
