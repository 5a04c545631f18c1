//! Two-tier error taxonomy for the sync pipeline.
//!
//! Item-scoped errors ([`ItemError`]) are caught at the per-item pipeline
//! boundary, appended to the job's error log, and processing continues with
//! the next evidence item. Job-scoped errors ([`JobError`]) abort the whole
//! job and transition it to `failed`.

use thiserror::Error;

use crate::models::SyncStage;

/// Errors from the upstream case-management source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("case {0} not found")]
    CaseNotFound(i64),

    #[error("evidence {0} not found")]
    EvidenceNotFound(i64),

    #[error("authentication rejected by case source")]
    Auth,

    #[error("transient case source error: {0}")]
    Transient(String),

    #[error("case source error: {0}")]
    Api(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// The byte stream could not be parsed as the declared document type at all.
///
/// Recoverable issues (partial content, malformed substructure, unsupported
/// types) never produce this error; they surface as warnings instead.
#[derive(Debug, Error)]
#[error("cannot parse {content_type} stream ({byte_len} bytes): {details}")]
pub struct ExtractError {
    pub content_type: String,
    pub byte_len: usize,
    pub details: String,
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunking config: {0}")]
    InvalidConfig(String),

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("token decode failed: {0}")]
    Decode(String),
}

/// A failed embedding sub-batch, carrying the item range that failed.
///
/// Already-succeeded sub-batches are unaffected.
#[derive(Debug, Error)]
#[error("embedding failed for items {start}..{end}: {details}")]
pub struct EmbedError {
    pub start: usize,
    pub end: usize,
    pub details: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A recoverable failure while processing a single evidence item.
///
/// The variant determines the [`SyncStage`] recorded in the job's error log.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] SourceError),

    #[error("extract failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("chunk failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("embed failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("persist failed: {0}")]
    Persist(#[from] StoreError),
}

impl ItemError {
    pub fn stage(&self) -> SyncStage {
        match self {
            ItemError::Fetch(_) => SyncStage::Fetch,
            ItemError::Extract(_) => SyncStage::Extract,
            ItemError::Chunk(_) => SyncStage::Chunk,
            ItemError::Embed(_) => SyncStage::Embed,
            ItemError::Persist(_) => SyncStage::Persist,
        }
    }
}

/// A non-recoverable condition that prevents any further processing.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("case {0} not found upstream")]
    CaseNotFound(i64),

    #[error("case source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("store failure outside item scope: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_errors_map_to_stages() {
        let err = ItemError::Fetch(SourceError::Transient("timeout".into()));
        assert_eq!(err.stage(), SyncStage::Fetch);

        let err = ItemError::Extract(ExtractError {
            content_type: "application/pdf".into(),
            byte_len: 12,
            details: "bad xref".into(),
        });
        assert_eq!(err.stage(), SyncStage::Extract);

        let err = ItemError::Embed(EmbedError {
            start: 0,
            end: 32,
            details: "backend down".into(),
        });
        assert_eq!(err.stage(), SyncStage::Embed);
    }
}
