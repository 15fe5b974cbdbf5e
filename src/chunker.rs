//! Fixed-size character chunking with overlap and word-boundary snapping.

use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{debug, warn};

use crate::error::ChunkError;
use crate::vector_entry::{Chunk, DocumentInfo};

/// Upper bound on how far a boundary may be pulled back to reach whitespace.
const MAX_LOOKBACK: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Window size in characters
    pub chunk_size: usize,
    /// Characters shared by consecutive windows
    pub chunk_overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            chunk_overlap: 200,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.chunk_size == 0 {
            return Err(ChunkError::InvalidConfig(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ChunkError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn lookback(&self) -> usize {
        (self.chunk_size / 10).min(MAX_LOOKBACK)
    }
}

pub struct Chunker {
    config: ChunkConfig,
    tokenizer: Option<CoreBPE>,
}

impl Chunker {
    /// Build a chunker that counts tokens with the `cl100k_base` BPE,
    /// falling back to word counts if the tokenizer cannot be loaded.
    pub fn new(config: ChunkConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        let tokenizer = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("cl100k_base tokenizer unavailable, counting words instead: {}", e);
                None
            }
        };
        Ok(Self { config, tokenizer })
    }

    /// Build a chunker that always counts whitespace-separated words.
    pub fn without_tokenizer(config: ChunkConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        Ok(Self {
            config,
            tokenizer: None,
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        match &self.tokenizer {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.split_whitespace().count(),
        }
    }

    /// Split `text` into overlapping windows tagged with `document`.
    pub fn chunk(&self, text: &str, document: &DocumentInfo) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let chunk_size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;
        let lookback = self.config.lookback();

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut window = 0;

        while start < len {
            let mut end = start + chunk_size;

            if end < len {
                if let Some(back) = (0..lookback).find(|&i| chars[end - i].is_whitespace()) {
                    end -= back;
                }
            }

            let stop = end.min(len);
            let raw: String = chars[start..stop].iter().collect();
            let trimmed = raw.trim();

            if !trimmed.is_empty() {
                chunks.push(Chunk {
                    id: chunks.len(),
                    source_document: document.file_name.clone(),
                    text: trimmed.to_string(),
                    start_offset: start,
                    end_offset: stop,
                    sequence_index: window,
                    token_count: self.count_tokens(trimmed),
                    document: document.clone(),
                });
            }

            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
            window += 1;
        }

        debug!(
            "Chunked {} ({} chars) into {} chunks over {} windows",
            document.file_name,
            len,
            chunks.len(),
            window
        );
        chunks
    }
}
