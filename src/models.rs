//! Core data models used throughout Evidence Harness.
//!
//! These types represent the cases, evidence files, documents, chunks, and
//! sync jobs that flow through the ingestion pipeline.

use serde::{Deserialize, Serialize};

/// Case metadata fetched from the upstream case-management API.
#[derive(Debug, Clone)]
pub struct CaseMetadata {
    pub case_id: i64,
    pub case_name: String,
    pub case_description: Option<String>,
    pub client_name: Option<String>,
}

/// One evidence file listed for a case at the upstream source.
#[derive(Debug, Clone)]
pub struct EvidenceRef {
    pub id: i64,
    pub filename: String,
    pub mime_hint: Option<String>,
    pub byte_size: Option<i64>,
    pub description: Option<String>,
}

/// Normalized document stored in SQLite.
///
/// The fingerprint is unique across the whole corpus: byte-identical
/// evidence uploaded to different cases references the same row.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub byte_size: i64,
    pub fingerprint: String,
    pub storage_path: Option<String>,
    pub uploaded_at: i64,
    pub metadata_json: String,
}

/// A token-bounded segment of a document's extracted text.
///
/// Indices are contiguous from 0 within a document and follow the original
/// text order. The embedding is `None` until (and unless) the embedding
/// stage succeeds.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub case_id: i64,
    pub chunk_index: i64,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub token_count: i64,
    pub metadata_json: String,
    pub created_at: i64,
}

/// Lifecycle states of a sync job.
///
/// `Failed` and the two `Completed*` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    /// The exact persisted status string expected by consumers.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage at which a recoverable per-item failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Fetch,
    Extract,
    Chunk,
    Embed,
    Persist,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Fetch => "fetch",
            SyncStage::Extract => "extract",
            SyncStage::Chunk => "chunk",
            SyncStage::Embed => "embed",
            SyncStage::Persist => "persist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(SyncStage::Fetch),
            "extract" => Some(SyncStage::Extract),
            "chunk" => Some(SyncStage::Chunk),
            "embed" => Some(SyncStage::Embed),
            "persist" => Some(SyncStage::Persist),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recoverable failure logged against a sync job.
#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorRecord {
    pub evidence_id: String,
    pub stage: SyncStage,
    pub message: String,
    pub created_at: i64,
}

/// One end-to-end sync attempt for a single case.
///
/// Created `pending`, driven through the state machine by the orchestrator,
/// and retained indefinitely for audit. The error list is append-only and
/// ordered.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: String,
    pub case_id: i64,
    pub status: JobStatus,
    pub force_reindex: bool,
    pub cancel_requested: bool,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub documents_synced: i64,
    pub chunks_created: i64,
    pub error_message: Option<String>,
    pub metadata_json: String,
    pub created_at: i64,
    pub errors: Vec<SyncErrorRecord>,
}
