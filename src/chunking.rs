//! Token-budget chunking with overlap and rebalancing.
//!
//! Text is split at word granularity: a word is a maximal run of non-whitespace together with the
//! whitespace that follows it, so word spans tile the input exactly. A chunk is a window over the
//! word spans made of a leading overlap (words repeated from the previous chunk) and a core (words
//! that appear in no earlier core). Concatenating the cores reconstructs the input byte for byte.
//!
//! The chunker runs three passes:
//!
//! - Greedy: accumulate words until the next one would push the core past
//!   `budget - overlap`, then seed the next window with the trailing words of the one just
//!   closed (at most `overlap` tokens).
//! - Bisect: while there are fewer chunks than requested, split the largest chunk at its middle
//!   word and re-apply overlap.
//! - Merge (only with an explicit target count): while there are more chunks than requested,
//!   merge the adjacent pair whose combination is smallest and still within budget.
//!
//! The budget is authoritative. The requested count is a lower bound that bisecting meets when
//! the text has enough words, and an upper bound only when merging stays within budget.
//!
//! A single word whose token count exceeds the budget is never split: it becomes a singleton
//! chunk flagged [`Chunk::oversized`]. Tokens are the atomic unit of the model but words are the
//! atomic unit here, and a chunk that locally violates the budget is preferable to one that cuts
//! a word in half.

use thiserror::Error;

use crate::resources::{ModelHandle, TokenCounter};

/// Errors produced while turning raw text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Caller asked for an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
}

/// Contiguous, token-bounded slice of a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk text, including the leading overlap.
    pub text: String,
    /// Token count of `text` under the chunker's counter.
    pub token_count: usize,
    /// Byte length of the leading overlap inside `text`.
    pub overlap_len: usize,
    /// Single word that alone exceeds the budget.
    pub oversized: bool,
}

impl Chunk {
    /// Chunk text without the overlap repeated from the previous chunk.
    pub fn core(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

/// Splits text into chunks using a model's token counter.
#[derive(Clone)]
pub struct TextChunker {
    counter: TokenCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    start: usize,
    core_start: usize,
    end: usize,
    tokens: usize,
}

impl Window {
    fn core_words(&self) -> usize {
        self.end - self.core_start
    }
}

struct Layout<'a> {
    text: &'a str,
    spans: Vec<(usize, usize)>,
    word_tokens: Vec<usize>,
    budget: usize,
    overlap: usize,
}

impl TextChunker {
    /// Chunker counting tokens with `counter`.
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    /// Chunker counting tokens the way `model` does.
    pub fn for_model(model: &ModelHandle) -> Self {
        Self::new(model.token_counter())
    }

    /// Count tokens in `text`.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.as_ref()(text)
    }

    /// Split `text` into chunks of at most `budget` tokens, at least `min_chunks` when possible.
    ///
    /// Returns an empty vector when the input is all whitespace.
    pub fn split(
        &self,
        text: &str,
        budget: usize,
        overlap: usize,
        min_chunks: usize,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        let Some(layout) = self.layout(text, budget, overlap)? else {
            return Ok(Vec::new());
        };
        let mut windows = self.greedy(&layout);
        self.bisect(&layout, &mut windows, min_chunks);
        Ok(self.materialize(&layout, windows))
    }

    /// Split `text` aiming for exactly `target` chunks.
    ///
    /// Bisecting and merging both stop rather than break the budget, so the result can still
    /// differ from `target` for very short or very dense inputs.
    pub fn split_into(
        &self,
        text: &str,
        budget: usize,
        overlap: usize,
        target: usize,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        let Some(layout) = self.layout(text, budget, overlap)? else {
            return Ok(Vec::new());
        };
        let target = target.max(1);
        let mut windows = self.greedy(&layout);
        self.bisect(&layout, &mut windows, target);
        self.merge(&layout, &mut windows, target);
        Ok(self.materialize(&layout, windows))
    }

    fn layout<'a>(
        &self,
        text: &'a str,
        budget: usize,
        overlap: usize,
    ) -> Result<Option<Layout<'a>>, ChunkingError> {
        if budget == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        let spans = word_spans(text);
        let word_tokens = spans
            .iter()
            .map(|&(start, end)| self.count_tokens(&text[start..end]))
            .collect();
        Ok(Some(Layout {
            text,
            spans,
            word_tokens,
            budget,
            overlap: overlap.min(budget - 1),
        }))
    }

    fn greedy(&self, layout: &Layout<'_>) -> Vec<Window> {
        let words = layout.spans.len();
        let core_limit = layout.budget - layout.overlap;
        let mut windows = Vec::new();
        let mut start = 0;
        let mut core_start = 0;

        while core_start < words {
            let mut end = core_start + 1;
            let mut running = layout.word_tokens[core_start];
            while end < words && running + layout.word_tokens[end] <= core_limit {
                running += layout.word_tokens[end];
                end += 1;
            }

            let window = self.fit(layout, start, core_start, end);
            start = seed_start(layout, window.core_start, window.end);
            core_start = window.end;
            windows.push(window);
        }

        windows
    }

    /// Shrink a candidate window until its exact token count fits the budget.
    fn fit(&self, layout: &Layout<'_>, start: usize, core_start: usize, end: usize) -> Window {
        let mut window = Window {
            start,
            core_start,
            end,
            tokens: self.measure(layout, start, end),
        };
        while window.tokens > layout.budget && window.end > window.core_start + 1 {
            window.end -= 1;
            window.tokens = self.measure(layout, window.start, window.end);
        }
        if window.tokens > layout.budget && window.start < window.core_start {
            window.start = window.core_start;
            window.tokens = self.measure(layout, window.start, window.end);
        }
        window
    }

    fn bisect(&self, layout: &Layout<'_>, windows: &mut Vec<Window>, min_chunks: usize) {
        while windows.len() < min_chunks {
            let Some((index, _)) = windows
                .iter()
                .enumerate()
                .filter(|(_, window)| window.core_words() > 1)
                .max_by_key(|(_, window)| window.tokens)
            else {
                tracing::debug!(
                    chunks = windows.len(),
                    min_chunks,
                    "Every chunk is a single word; cannot bisect further"
                );
                break;
            };

            let window = windows[index];
            let mid = window.core_start + window.core_words() / 2;
            let left = self.fit(layout, window.start, window.core_start, mid);
            let right_start = seed_start(layout, window.core_start, mid);
            let right = self.fit(layout, right_start, mid, window.end);
            windows.splice(index..=index, [left, right]);
        }
    }

    fn merge(&self, layout: &Layout<'_>, windows: &mut Vec<Window>, target: usize) {
        while windows.len() > target {
            let best = windows
                .windows(2)
                .enumerate()
                .map(|(index, pair)| {
                    let tokens = self.measure(layout, pair[0].start, pair[1].end);
                    (index, tokens)
                })
                .filter(|&(_, tokens)| tokens <= layout.budget)
                .min_by_key(|&(_, tokens)| tokens);

            let Some((index, tokens)) = best else {
                tracing::debug!(
                    chunks = windows.len(),
                    target,
                    "No adjacent chunks fit the budget when merged"
                );
                break;
            };

            let merged = Window {
                start: windows[index].start,
                core_start: windows[index].core_start,
                end: windows[index + 1].end,
                tokens,
            };
            windows.splice(index..=index + 1, [merged]);
        }
    }

    fn measure(&self, layout: &Layout<'_>, start: usize, end: usize) -> usize {
        self.count_tokens(slice(layout, start, end))
    }

    fn materialize(&self, layout: &Layout<'_>, windows: Vec<Window>) -> Vec<Chunk> {
        windows
            .into_iter()
            .map(|window| {
                let oversized = window.tokens > layout.budget;
                if oversized {
                    tracing::warn!(
                        tokens = window.tokens,
                        budget = layout.budget,
                        "Single word exceeds the token budget; emitting it as its own chunk"
                    );
                }
                Chunk {
                    text: slice(layout, window.start, window.end).to_string(),
                    token_count: window.tokens,
                    overlap_len: layout.spans[window.core_start].0 - layout.spans[window.start].0,
                    oversized,
                }
            })
            .collect()
    }
}

/// First word of the overlap seeded from the core `[core_start, end)` of the previous window.
fn seed_start(layout: &Layout<'_>, core_start: usize, end: usize) -> usize {
    let mut start = end;
    let mut filled = 0;
    while start > core_start && filled + layout.word_tokens[start - 1] <= layout.overlap {
        filled += layout.word_tokens[start - 1];
        start -= 1;
    }
    start
}

fn slice<'a>(layout: &Layout<'a>, start: usize, end: usize) -> &'a str {
    &layout.text[layout.spans[start].0..layout.spans[end - 1].1]
}

/// Byte spans of each word plus its trailing whitespace. Leading whitespace joins the first word.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut in_word = false;
    let mut seen_word = false;

    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            if seen_word {
                spans.push((start, index));
                start = index;
            }
            in_word = true;
            seen_word = true;
        }
    }
    if seen_word {
        spans.push((start, text.len()));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::tokenize::{tiktoken_counter, whitespace_counter};
    use std::sync::Arc;

    fn chunker() -> TextChunker {
        TextChunker::new(whitespace_counter())
    }

    fn reconstruct(chunks: &[Chunk]) -> String {
        chunks.iter().map(Chunk::core).collect()
    }

    fn trimmed(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|chunk| chunk.text.trim()).collect()
    }

    #[test]
    fn split_respects_budget_with_whitespace_counter() {
        let chunks = chunker()
            .split("one two three four five", 2, 0, 1)
            .expect("chunks");
        assert_eq!(trimmed(&chunks), vec!["one two", "three four", "five"]);
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 2));
    }

    #[test]
    fn split_without_overlap_reconstructs_input_exactly() {
        let text = "  alpha  beta\n\ngamma\tdelta epsilon\u{00a0}zeta eta ";
        let chunks = chunker().split(text, 3, 0, 0).expect("chunks");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.iter().map(|c| c.text.as_str()).collect::<String>(), text);
    }

    #[test]
    fn split_applies_overlap_between_chunks() {
        let text = "one two three four five";
        let chunks = chunker().split(text, 3, 1, 1).expect("chunks");
        assert_eq!(
            trimmed(&chunks),
            vec!["one two", "two three four", "four five"]
        );
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 3));
        assert_eq!(chunks[0].overlap_len, 0);
        assert_eq!(&chunks[1].text[..chunks[1].overlap_len], "two ");
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn overlap_is_clamped_below_budget() {
        let text = "a b c d e";
        let chunks = chunker().split(text, 2, 10, 1).expect("chunks");
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 2));
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn split_bisects_until_min_chunks() {
        let text = "a b c d";
        let chunks = chunker().split(text, 10, 0, 3).expect("chunks");
        assert_eq!(chunks.len(), 3);
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn bisect_reseeds_overlap_for_each_half() {
        let text = "a b c d e f g h";
        let chunks = chunker().split(text, 10, 2, 3).expect("chunks");
        assert_eq!(trimmed(&chunks), vec!["a b c d", "c d e f", "e f g h"]);
        assert!(chunks.iter().all(|chunk| chunk.token_count <= 10));
        assert_eq!(chunks[0].overlap_len, 0);
        assert_eq!(&chunks[1].text[..chunks[1].overlap_len], "c d ");
        assert_eq!(&chunks[2].text[..chunks[2].overlap_len], "e f ");
        assert_eq!(reconstruct(&chunks), text);
    }

    #[test]
    fn bisect_stops_when_words_run_out() {
        let chunks = chunker().split("solo", 10, 0, 3).expect("chunks");
        assert_eq!(trimmed(&chunks), vec!["solo"]);
    }

    #[test]
    fn split_into_merges_adjacent_chunks_within_budget() {
        let text = "a b c d e f";
        let greedy = chunker().split(text, 4, 2, 1).expect("chunks");
        assert_eq!(greedy.len(), 3);

        let merged = chunker().split_into(text, 4, 2, 2).expect("chunks");
        assert_eq!(trimmed(&merged), vec!["a b c d", "c d e f"]);
        assert!(merged.iter().all(|chunk| chunk.token_count <= 4));
        assert_eq!(reconstruct(&merged), text);
    }

    #[test]
    fn merge_picks_the_smallest_adjacent_pair() {
        let counter: TokenCounter =
            Arc::new(|segment: &str| segment.split_whitespace().map(str::len).sum::<usize>());
        let chunker = TextChunker::new(counter);
        let text = "aaa b c d e ff";
        let greedy = chunker.split(text, 7, 3, 1).expect("chunks");
        assert_eq!(trimmed(&greedy), vec!["aaa b", "b c d e", "c d e ff"]);

        // Both pairs fit; the right one costs 6 tokens against 7 on the left.
        let merged = chunker.split_into(text, 7, 3, 2).expect("chunks");
        assert_eq!(trimmed(&merged), vec!["aaa b", "b c d e ff"]);
        assert_eq!(merged[1].token_count, 6);
        assert_eq!(reconstruct(&merged), text);
    }

    #[test]
    fn merge_never_exceeds_budget() {
        let chunks = chunker().split_into("a b c d e f", 2, 0, 1).expect("chunks");
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn oversized_word_becomes_flagged_singleton() {
        let counter: TokenCounter = Arc::new(|segment: &str| segment.trim().chars().count());
        let chunks = TextChunker::new(counter)
            .split("ab abcdefghij cd", 4, 0, 1)
            .expect("chunks");
        assert_eq!(trimmed(&chunks), vec!["ab", "abcdefghij", "cd"]);
        assert!(!chunks[0].oversized);
        assert!(chunks[1].oversized);
        assert_eq!(chunks[1].token_count, 10);
    }

    #[test]
    fn whitespace_input_yields_no_chunks() {
        assert!(chunker().split("", 4, 0, 1).expect("chunks").is_empty());
        assert!(chunker().split(" \n\t ", 4, 0, 3).expect("chunks").is_empty());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let error = chunker().split("hello", 0, 0, 1).unwrap_err();
        assert!(matches!(error, ChunkingError::InvalidChunkSize));
    }

    #[test]
    fn tiktoken_counts_stay_within_budget() {
        let counter = tiktoken_counter("cl100k_base").expect("encoding");
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let chunks = TextChunker::new(counter.clone())
            .split(&text, 16, 4, 1)
            .expect("chunks");
        for chunk in &chunks {
            assert!(counter.as_ref()(&chunk.text) <= 16);
        }
        assert_eq!(reconstruct(&chunks), text);
    }
}
