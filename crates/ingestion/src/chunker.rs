//! Markdown chunking
//!
//! Splits a Markdown document into chunks that respect heading, list and
//! paragraph boundaries before falling back to sentences and words.

use crate::errors::IngestionError;
use text_splitter::{ChunkConfig, MarkdownSplitter};
use tracing::debug;

/// Configuration for Markdown chunking
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in characters
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 100,
        }
    }
}

/// Builds a splitter once and reuses it for every document
pub struct Chunker {
    splitter: MarkdownSplitter<text_splitter::Characters>,
    config: ChunkingConfig,
}

impl Chunker {
    /// An overlap not smaller than the chunk size is rejected
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestionError> {
        let chunk_config = ChunkConfig::new(config.chunk_size)
            .with_overlap(config.chunk_overlap)
            .map_err(|e| IngestionError::Chunking(e.to_string()))?;

        Ok(Self {
            splitter: MarkdownSplitter::new(chunk_config),
            config,
        })
    }

    /// Split Markdown into trimmed, non-empty chunks in document order
    pub fn chunk(&self, markdown: &str) -> Vec<String> {
        let chunks: Vec<String> = self
            .splitter
            .chunks(markdown)
            .map(str::trim)
            .filter(|chunk| !chunk.is_empty())
            .map(str::to_string)
            .collect();

        debug!(
            input_len = markdown.len(),
            chunk_count = chunks.len(),
            chunk_size = self.config.chunk_size,
            "Markdown chunked"
        );

        chunks
    }
}
