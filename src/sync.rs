//! Sync job orchestration.
//!
//! [`SyncOrchestrator`] owns the job state machine
//! (`pending -> running -> {completed | completed_with_errors | failed}`)
//! and drives the per-evidence-item pipeline:
//! fetch -> fingerprint/dedup -> extract -> chunk -> embed -> persist.
//!
//! Item-scoped failures are logged against the job and processing continues;
//! only an unreachable or unknown case fails the whole job. Items run
//! concurrently up to `max_concurrent_items`; counters and the error log are
//! applied by the single coordinating loop from per-item outcome values, so
//! workers never touch shared job state. Cancellation is a flag on the job
//! row checked before each dispatch: running items finish, nothing new
//! starts, and the job closes as `completed_with_errors` with a cancellation
//! marker.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::{ChunkPiece, Chunker};
use crate::embedding::{embed_in_batches, Embedder};
use crate::error::{EmbedError, ItemError, JobError, StoreError};
use crate::extract::extract;
use crate::fingerprint::fingerprint;
use crate::models::{CaseMetadata, Chunk, Document, EvidenceRef, JobStatus, SyncJob, SyncStage};
use crate::source::CaseSource;
use crate::store::{PersistOutcome, Store};

pub struct SyncOrchestrator {
    store: Store,
    source: Arc<dyn CaseSource>,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<Chunker>,
    embed_batch_size: usize,
    max_concurrent_items: usize,
}

/// Everything an item worker needs, shared read-only across the job.
struct ItemContext {
    store: Store,
    source: Arc<dyn CaseSource>,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<Chunker>,
    case: CaseMetadata,
    force_reindex: bool,
    embed_batch_size: usize,
}

/// What one item worker hands back to the coordinating loop.
///
/// `error` and `stats` can both be set: an embedding failure is logged but
/// the document still lands with zero chunks.
struct ItemOutcome {
    evidence_id: i64,
    warnings: Vec<String>,
    error: Option<ItemError>,
    stats: Option<ItemStats>,
}

struct ItemStats {
    chunks_created: i64,
}

/// Counters accumulated by the coordinating loop. Persisted to the job row
/// after every applied item outcome so a `get_job` snapshot of a running
/// job shows real progress.
#[derive(Default)]
struct Progress {
    documents_synced: i64,
    chunks_created: i64,
    failures: usize,
    cancelled: bool,
}

impl SyncOrchestrator {
    pub fn new(
        store: Store,
        source: Arc<dyn CaseSource>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        embed_batch_size: usize,
        max_concurrent_items: usize,
    ) -> Self {
        Self {
            store,
            source,
            embedder,
            chunker: Arc::new(chunker),
            embed_batch_size,
            max_concurrent_items: max_concurrent_items.max(1),
        }
    }

    /// Create a `pending` job row for a case. The caller drives it with
    /// [`run_job`](Self::run_job).
    pub async fn start_sync(
        &self,
        case_id: i64,
        force_reindex: bool,
    ) -> Result<SyncJob, JobError> {
        let metadata = json!({ "force_reindex": force_reindex }).to_string();
        let job = self.store.create_job(case_id, force_reindex, &metadata).await?;
        Ok(job)
    }

    /// Start and run a sync to its terminal state. `limit` caps the number
    /// of evidence items processed.
    pub async fn run(
        &self,
        case_id: i64,
        force_reindex: bool,
        limit: Option<usize>,
    ) -> Result<SyncJob, JobError> {
        let job = self.start_sync(case_id, force_reindex).await?;
        self.run_job(&job, limit).await
    }

    /// Drive one job from `pending` to a terminal state and return the final
    /// snapshot. Job-level failures (unknown case, unreachable source) land
    /// in the job row as `failed`, not in the returned `Err`.
    pub async fn run_job(
        &self,
        job: &SyncJob,
        limit: Option<usize>,
    ) -> Result<SyncJob, JobError> {
        self.store.mark_running(&job.id).await?;
        info!(job_id = %job.id, case_id = job.case_id, "sync started");

        let case = match self.source.fetch_case(job.case_id).await {
            Ok(case) => case,
            Err(crate::error::SourceError::CaseNotFound(id)) => {
                return self
                    .fail_job(&job.id, &format!("case {} not found upstream", id))
                    .await;
            }
            Err(e) => {
                return self
                    .fail_job(&job.id, &format!("case source unreachable: {}", e))
                    .await;
            }
        };

        let mut evidence = match self.source.list_evidence(job.case_id).await {
            Ok(list) => list,
            Err(e) => {
                return self
                    .fail_job(&job.id, &format!("evidence listing failed: {}", e))
                    .await;
            }
        };
        if let Some(limit) = limit {
            evidence.truncate(limit);
        }

        let ctx = Arc::new(ItemContext {
            store: self.store.clone(),
            source: self.source.clone(),
            embedder: self.embedder.clone(),
            chunker: self.chunker.clone(),
            case,
            force_reindex: job.force_reindex,
            embed_batch_size: self.embed_batch_size,
        });

        let mut progress = Progress::default();
        let mut store_result = self
            .drive_items(&job.id, ctx, evidence, &mut progress)
            .await;
        if store_result.is_ok() && progress.cancelled {
            let metadata = json!({
                "force_reindex": job.force_reindex,
                "cancelled": true,
            })
            .to_string();
            store_result = self.store.update_job_metadata(&job.id, &metadata).await;
        }
        if let Err(e) = store_result {
            // Never strand the job in `running`: close it out with the
            // counters gathered so far, then surface the store error.
            let message = format!("sync interrupted: job store unavailable: {}", e);
            if let Err(close_err) = self
                .store
                .finish_job(
                    &job.id,
                    JobStatus::Failed,
                    progress.documents_synced,
                    progress.chunks_created,
                    Some(&message),
                )
                .await
            {
                warn!(job_id = %job.id, "could not mark interrupted job failed: {}", close_err);
            }
            return Err(JobError::Store(e));
        }

        let Progress {
            documents_synced,
            chunks_created,
            failures,
            cancelled,
        } = progress;

        let (status, message) = if cancelled {
            (
                JobStatus::CompletedWithErrors,
                Some("cancellation requested; remaining items were not processed"),
            )
        } else if failures > 0 {
            (JobStatus::CompletedWithErrors, None)
        } else {
            (JobStatus::Completed, None)
        };

        self.store
            .finish_job(&job.id, status, documents_synced, chunks_created, message)
            .await?;
        info!(
            job_id = %job.id,
            status = %status,
            documents_synced,
            chunks_created,
            "sync finished"
        );

        self.reload(&job.id).await
    }

    /// Dispatch items up to the concurrency bound and fold their outcomes
    /// into `progress`. Counters are written back to the job row after each
    /// applied outcome; the coordinating loop is the only writer.
    async fn drive_items(
        &self,
        job_id: &str,
        ctx: Arc<ItemContext>,
        evidence: Vec<EvidenceRef>,
        progress: &mut Progress,
    ) -> Result<(), StoreError> {
        let mut queue = evidence.into_iter();
        let mut join_set: JoinSet<ItemOutcome> = JoinSet::new();

        loop {
            while !progress.cancelled && join_set.len() < self.max_concurrent_items {
                if self.store.cancel_requested(job_id).await? {
                    progress.cancelled = true;
                    break;
                }
                let Some(item) = queue.next() else { break };
                let ctx = ctx.clone();
                join_set.spawn(async move { run_item(ctx, item).await });
            }

            let Some(joined) = join_set.join_next().await else {
                return Ok(());
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A panicked worker loses its item but not the job.
                    progress.failures += 1;
                    self.store
                        .append_error(
                            job_id,
                            "unknown",
                            SyncStage::Persist,
                            &format!("item worker aborted: {}", e),
                        )
                        .await?;
                    continue;
                }
            };

            let evidence_id = outcome.evidence_id.to_string();
            for warning in &outcome.warnings {
                self.store
                    .append_error(
                        job_id,
                        &evidence_id,
                        SyncStage::Extract,
                        &format!("warning: {}", warning),
                    )
                    .await?;
            }
            if let Some(err) = &outcome.error {
                warn!(job_id = %job_id, evidence_id = %evidence_id, stage = %err.stage(), "item failed: {}", err);
                progress.failures += 1;
                self.store
                    .append_error(job_id, &evidence_id, err.stage(), &err.to_string())
                    .await?;
            }
            if let Some(stats) = &outcome.stats {
                progress.documents_synced += 1;
                progress.chunks_created += stats.chunks_created;
                self.store
                    .update_job_progress(
                        job_id,
                        progress.documents_synced,
                        progress.chunks_created,
                    )
                    .await?;
            }
        }
    }

    async fn fail_job(&self, job_id: &str, message: &str) -> Result<SyncJob, JobError> {
        warn!(job_id = %job_id, "sync failed: {}", message);
        self.store
            .finish_job(job_id, JobStatus::Failed, 0, 0, Some(message))
            .await?;
        self.reload(job_id).await
    }

    async fn reload(&self, job_id: &str) -> Result<SyncJob, JobError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(JobError::Store(StoreError::Db(sqlx::Error::RowNotFound)))
    }
}

/// Text, chunks, and vectors for one evidence item, before persistence.
struct Prepared {
    content_type: String,
    pieces: Vec<ChunkPiece>,
    vectors: Vec<Vec<f32>>,
    embed_error: Option<EmbedError>,
    warnings: Vec<String>,
}

async fn run_item(ctx: Arc<ItemContext>, evidence: EvidenceRef) -> ItemOutcome {
    let mut outcome = ItemOutcome {
        evidence_id: evidence.id,
        warnings: Vec::new(),
        error: None,
        stats: None,
    };

    let bytes = match ctx
        .source
        .download_evidence(ctx.case.case_id, evidence.id)
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            outcome.error = Some(ItemError::Fetch(e));
            return outcome;
        }
    };

    let digest = fingerprint(&bytes);
    let existing = match ctx.store.find_document_by_fingerprint(&digest).await {
        Ok(existing) => existing,
        Err(e) => {
            outcome.error = Some(ItemError::Persist(e));
            return outcome;
        }
    };

    if let Some(doc) = existing {
        return dedup_hit(&ctx, &evidence, &bytes, doc, outcome).await;
    }

    let prepared = match prepare(&ctx, &evidence, &bytes).await {
        Ok(prepared) => prepared,
        Err(e) => {
            outcome.error = Some(e);
            return outcome;
        }
    };
    outcome.warnings = prepared.warnings.clone();

    let now = Utc::now().timestamp();
    let document = Document {
        id: Uuid::new_v4().to_string(),
        name: evidence.filename.clone(),
        content_type: prepared.content_type.clone(),
        byte_size: bytes.len() as i64,
        fingerprint: digest,
        storage_path: None,
        uploaded_at: now,
        metadata_json: json!({
            "evidence_id": evidence.id,
            "description": evidence.description,
            "case_name": ctx.case.case_name,
        })
        .to_string(),
    };

    // On an embedding failure the document still lands, with zero chunks.
    let chunks = if prepared.embed_error.is_some() {
        Vec::new()
    } else {
        build_chunks(&document, ctx.case.case_id, &evidence, &prepared, now)
    };

    match ctx.store.insert_document_with_chunks(&document, &chunks).await {
        Ok(PersistOutcome::Inserted) => {
            if let Err(e) = ctx
                .store
                .link_case_document(ctx.case.case_id, &document.id)
                .await
            {
                outcome.error = Some(ItemError::Persist(e));
                return outcome;
            }
            outcome.error = prepared.embed_error.map(ItemError::Embed);
            outcome.stats = Some(ItemStats {
                chunks_created: chunks.len() as i64,
            });
            outcome
        }
        Ok(PersistOutcome::RaceLost(winner)) => {
            // Another writer landed the same bytes first; the winner's
            // chunks stand and this becomes a plain dedup hit.
            if let Err(e) = ctx
                .store
                .link_case_document(ctx.case.case_id, &winner.id)
                .await
            {
                outcome.error = Some(ItemError::Persist(e));
                return outcome;
            }
            outcome.error = None;
            outcome.stats = Some(ItemStats { chunks_created: 0 });
            outcome
        }
        Err(e) => {
            outcome.error = Some(ItemError::Persist(e));
            outcome
        }
    }
}

/// Dedup is about recomputation, not case visibility: the existing document
/// is linked to this case and counted as synced. With `force_reindex` the
/// chunks are rebuilt and swapped atomically.
async fn dedup_hit(
    ctx: &ItemContext,
    evidence: &EvidenceRef,
    bytes: &[u8],
    doc: Document,
    mut outcome: ItemOutcome,
) -> ItemOutcome {
    if let Err(e) = ctx.store.link_case_document(ctx.case.case_id, &doc.id).await {
        outcome.error = Some(ItemError::Persist(e));
        return outcome;
    }

    if !ctx.force_reindex {
        outcome.stats = Some(ItemStats { chunks_created: 0 });
        return outcome;
    }

    let prepared = match prepare(ctx, evidence, bytes).await {
        Ok(prepared) => prepared,
        Err(e) => {
            outcome.error = Some(e);
            return outcome;
        }
    };
    outcome.warnings = prepared.warnings.clone();

    if let Some(embed_error) = prepared.embed_error {
        // Keep the existing chunks rather than replacing them with nothing.
        outcome.error = Some(ItemError::Embed(embed_error));
        outcome.stats = Some(ItemStats { chunks_created: 0 });
        return outcome;
    }

    let now = Utc::now().timestamp();
    let chunks = build_chunks(&doc, ctx.case.case_id, evidence, &prepared, now);
    match ctx.store.replace_chunks(&doc.id, &chunks).await {
        Ok(()) => {
            outcome.stats = Some(ItemStats {
                chunks_created: chunks.len() as i64,
            });
        }
        Err(e) => {
            outcome.error = Some(ItemError::Persist(e));
        }
    }
    outcome
}

async fn prepare(
    ctx: &ItemContext,
    evidence: &EvidenceRef,
    bytes: &[u8],
) -> Result<Prepared, ItemError> {
    let extracted = extract(bytes, evidence.mime_hint.as_deref(), &evidence.filename)?;
    let pieces = ctx.chunker.chunk(&extracted.text)?;

    let (vectors, embed_error) = if pieces.is_empty() {
        (Vec::new(), None)
    } else {
        let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
        match embed_in_batches(ctx.embedder.as_ref(), &texts, ctx.embed_batch_size).await {
            Ok(vectors) => (vectors, None),
            Err(e) => (Vec::new(), Some(e)),
        }
    };

    Ok(Prepared {
        content_type: extracted.kind.mime().to_string(),
        pieces,
        vectors,
        embed_error,
        warnings: extracted.warnings,
    })
}

fn build_chunks(
    document: &Document,
    case_id: i64,
    evidence: &EvidenceRef,
    prepared: &Prepared,
    now: i64,
) -> Vec<Chunk> {
    let total_tokens = prepared.pieces.last().map(|p| p.end_token).unwrap_or(0);
    prepared
        .pieces
        .iter()
        .zip(prepared.vectors.iter())
        .map(|(piece, vector)| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            case_id,
            chunk_index: piece.chunk_index as i64,
            text: piece.text.clone(),
            embedding: Some(vector.clone()),
            token_count: piece.token_count as i64,
            metadata_json: json!({
                "document_name": document.name,
                "evidence_id": evidence.id,
                "start_token": piece.start_token,
                "end_token": piece.end_token,
                "total_tokens": total_tokens,
            })
            .to_string(),
            created_at: now,
        })
        .collect()
}
