//! Token-window chunking with overlap and sentence-boundary preference.
//!
//! Text is split on tokenizer units (cl100k_base), not characters, so chunk
//! sizes line up with embedding model limits. Windows of `chunk_size_tokens`
//! advance by `chunk_size_tokens - overlap_tokens`; a cut retracts to the
//! nearest sentence end within a small tolerance so chunks tend to close on
//! complete sentences. Retraction never extends a window, so the token cap
//! always holds.

use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::config::ChunkingConfig;
use crate::error::ChunkError;

/// Fraction of the window a cut may retract when hunting for a sentence end.
const BOUNDARY_TOLERANCE_DIVISOR: usize = 10;

/// One chunk of a document, with its token-space position.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    /// Offset of the first token in the document's token sequence.
    pub start_token: usize,
    /// Offset one past the last token.
    pub end_token: usize,
}

pub struct Chunker {
    bpe: CoreBPE,
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, ChunkError> {
        if config.chunk_size_tokens == 0 {
            return Err(ChunkError::InvalidConfig(
                "chunk_size_tokens must be > 0".to_string(),
            ));
        }
        if config.overlap_tokens >= config.chunk_size_tokens {
            return Err(ChunkError::InvalidConfig(format!(
                "overlap_tokens ({}) must be strictly less than chunk_size_tokens ({})",
                config.overlap_tokens, config.chunk_size_tokens
            )));
        }
        let bpe = cl100k_base().map_err(|e| ChunkError::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe,
            chunk_size: config.chunk_size_tokens,
            overlap: config.overlap_tokens,
        })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Split `text` into overlapping token windows.
    ///
    /// Deterministic for a given text and configuration. Empty or
    /// whitespace-only input yields zero chunks.
    pub fn chunk(&self, text: &str) -> Result<Vec<ChunkPiece>, ChunkError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tokens = self.bpe.encode_ordinary(text);
        let total = tokens.len();
        let mut pieces = Vec::new();
        let mut start = 0usize;

        while start < total {
            let hard_end = (start + self.chunk_size).min(total);
            let end = if hard_end < total {
                self.boundary_cut(&tokens, start, hard_end)
            } else {
                hard_end
            };

            let piece_text = self
                .bpe
                .decode(tokens[start..end].to_vec())
                .map_err(|e| ChunkError::Decode(e.to_string()))?;
            pieces.push(ChunkPiece {
                chunk_index: pieces.len(),
                text: piece_text,
                token_count: end - start,
                start_token: start,
                end_token: end,
            });

            if end >= total {
                break;
            }
            let next = end.saturating_sub(self.overlap);
            // A heavily retracted cut could fail to advance; step past it.
            start = if next > start { next } else { end };
        }

        Ok(pieces)
    }

    /// Retract `hard_end` to the nearest token that closes a sentence, within
    /// a tolerance of one tenth of the window. Scanning backwards from the
    /// exact cut means the candidate closest to it wins. Falls back to the
    /// exact cut when no sentence end is in range.
    fn boundary_cut(&self, tokens: &[u32], start: usize, hard_end: usize) -> usize {
        let tolerance = (self.chunk_size / BOUNDARY_TOLERANCE_DIVISOR).max(1);
        let floor = hard_end.saturating_sub(tolerance).max(start + 1);
        for end in (floor..=hard_end).rev() {
            if let Ok(piece) = self.bpe.decode(vec![tokens[end - 1]]) {
                let trimmed = piece.trim_end_matches([' ', '\t']);
                if trimmed.ends_with(['.', '!', '?']) || trimmed.ends_with('\n') {
                    return end;
                }
            }
        }
        hard_end
    }
}
