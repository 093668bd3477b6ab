use text_splitter::{ChunkConfig, TextSplitter};
use tiktoken_rs::cl100k_base;

use crate::config::ChunkingConfig;

/// Splits document text into overlapping, token-bounded windows sized for
/// the embedder. Boundary preference (paragraph > line > sentence > comma >
/// space > hard cut) is handled internally by `text-splitter`'s semantic
/// levels, the same crate the teacher's `document::chunker::TextChunker`
/// uses for its `chunk_semantic` strategy.
pub struct Chunker {
    max_tokens: usize,
    overlap_tokens: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            overlap_tokens: config.overlap_tokens,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    /// Empty or whitespace-only input yields an empty list. Text that fits
    /// within `max_tokens` is returned as a single chunk.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let tokenizer = cl100k_base().expect("cl100k_base tokenizer data is bundled");
        let chunk_config = ChunkConfig::new(self.max_tokens)
            .with_sizer(tokenizer)
            .with_overlap(self.overlap_tokens)
            .expect("overlap must not exceed max_tokens");

        let splitter = TextSplitter::new(chunk_config);
        splitter.chunks(text).map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_tokens: usize, overlap_tokens: usize) -> Chunker {
        Chunker {
            max_tokens,
            overlap_tokens,
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let c = chunker(512, 128);
        assert!(c.chunk("").is_empty());
        assert!(c.chunk("   \n\t  ").is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let c = chunker(512, 128);
        let chunks = c.chunk("a short paragraph about nothing in particular.");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_text_produces_multiple_overlapping_chunks() {
        let c = chunker(32, 8);
        let paragraph = "the quick brown fox jumps over the lazy dog. ".repeat(40);
        let chunks = c.chunk(&paragraph);
        assert!(chunks.len() > 1);
    }
}
