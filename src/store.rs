//! SQLite persistence for documents, chunks, and sync jobs.
//!
//! All writes that must be observed together happen in one transaction:
//! a document and its chunks either all land or none do, so a partially
//! synced item is never visible. The UNIQUE fingerprint constraint on
//! `documents` is the sole cross-job mutual-exclusion mechanism for
//! deduplication; a lost insert race is recovered by re-reading the
//! winner's row.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::StoreError;
use crate::models::{Chunk, Document, JobStatus, SyncErrorRecord, SyncJob, SyncStage};

/// Outcome of attempting to insert a new document.
#[derive(Debug)]
pub enum PersistOutcome {
    /// The document and its chunks were inserted.
    Inserted,
    /// Another writer inserted the same fingerprint first; this is the
    /// winning row.
    RaceLost(Document),
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Jobs ============

    pub async fn create_job(
        &self,
        case_id: i64,
        force_reindex: bool,
        metadata_json: &str,
    ) -> Result<SyncJob, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, case_id, status, force_reindex, metadata_json, created_at)
            VALUES (?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(case_id)
        .bind(force_reindex)
        .bind(metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(SyncJob {
            id,
            case_id,
            status: JobStatus::Pending,
            force_reindex,
            cancel_requested: false,
            started_at: None,
            completed_at: None,
            documents_synced: 0,
            chunks_created: 0,
            error_message: None,
            metadata_json: metadata_json.to_string(),
            created_at: now,
            errors: Vec::new(),
        })
    }

    /// Load a job with its full ordered error log.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;

        let error_rows = sqlx::query(
            "SELECT evidence_id, stage, message, created_at FROM sync_errors WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &error_rows {
            let stage: String = row.try_get("stage").map_err(StoreError::Db)?;
            job.errors.push(SyncErrorRecord {
                evidence_id: row.try_get("evidence_id").map_err(StoreError::Db)?,
                stage: SyncStage::parse(&stage)
                    .ok_or_else(|| decode_err(format!("unknown sync stage: {}", stage)))?,
                message: row.try_get("message").map_err(StoreError::Db)?,
                created_at: row.try_get("created_at").map_err(StoreError::Db)?,
            });
        }

        Ok(Some(job))
    }

    /// List jobs, newest first, without loading their error logs.
    pub async fn list_jobs(
        &self,
        case_id: Option<i64>,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<SyncJob>, StoreError> {
        let mut sql = String::from("SELECT * FROM sync_jobs WHERE 1=1");
        if case_id.is_some() {
            sql.push_str(" AND case_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(case_id) = case_id {
            query = query.bind(case_id);
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn mark_running(&self, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_jobs SET status = 'running', started_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transition a job to a terminal state with its final counters.
    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        documents_synced: i64,
        chunks_created: i64,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = ?, completed_at = ?, documents_synced = ?, chunks_created = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(documents_synced)
        .bind(chunks_created)
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write the running counters so status snapshots track a live job.
    pub async fn update_job_progress(
        &self,
        job_id: &str,
        documents_synced: i64,
        chunks_created: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_jobs SET documents_synced = ?, chunks_created = ? WHERE id = ?")
            .bind(documents_synced)
            .bind(chunks_created)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_job_metadata(
        &self,
        job_id: &str,
        metadata_json: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_jobs SET metadata_json = ? WHERE id = ?")
            .bind(metadata_json)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flag a non-terminal job for cancellation. Returns false when the job
    /// does not exist or already reached a terminal state.
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET cancel_requested = 1
            WHERE id = ? AND status IN ('pending', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_requested(&self, job_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<bool, _>("cancel_requested"))
            .transpose()?
            .unwrap_or(false))
    }

    /// Append one entry to a job's ordered error log.
    pub async fn append_error(
        &self,
        job_id: &str,
        evidence_id: &str,
        stage: SyncStage,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_errors (job_id, evidence_id, stage, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(evidence_id)
        .bind(stage.as_str())
        .bind(message)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Documents ============

    pub async fn find_document_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r)).transpose()
    }

    /// Make a document visible to a case. Idempotent; returns true when the
    /// link is new.
    pub async fn link_case_document(
        &self,
        case_id: i64,
        document_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO case_documents (case_id, document_id, linked_at) VALUES (?, ?, ?)",
        )
        .bind(case_id)
        .bind(document_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a new document and all of its chunks atomically.
    ///
    /// When another writer lands the same fingerprint first, nothing is
    /// written and the winner's row is returned instead.
    pub async fn insert_document_with_chunks(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents
                (id, name, content_type, byte_size, fingerprint, storage_path, uploaded_at, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.name)
        .bind(&document.content_type)
        .bind(document.byte_size)
        .bind(&document.fingerprint)
        .bind(&document.storage_path)
        .bind(document.uploaded_at)
        .bind(&document.metadata_json)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tx.rollback().await?;
                let winner = self
                    .find_document_by_fingerprint(&document.fingerprint)
                    .await?
                    .ok_or_else(|| {
                        decode_err(format!(
                            "fingerprint {} vanished after unique violation",
                            document.fingerprint
                        ))
                    })?;
                return Ok(PersistOutcome::RaceLost(winner));
            }
            Err(e) => return Err(e.into()),
        }

        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(PersistOutcome::Inserted)
    }

    /// Replace all chunks of an existing document atomically. Readers never
    /// observe the document with a partial chunk set.
    pub async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn count_documents_for_case(&self, case_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM case_documents WHERE case_id = ?")
            .bind(case_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_chunks_for_case(&self, case_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunks WHERE case_id = ?")
            .bind(case_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

async fn insert_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &Chunk,
) -> Result<(), StoreError> {
    let blob = chunk.embedding.as_ref().map(|v| vec_to_blob(v));
    sqlx::query(
        r#"
        INSERT INTO chunks
            (id, document_id, case_id, chunk_index, text, embedding, token_count, metadata_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.case_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.text)
    .bind(blob)
    .bind(chunk.token_count)
    .bind(&chunk.metadata_json)
    .bind(chunk.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_err(message: String) -> StoreError {
    StoreError::Db(sqlx::Error::Decode(message.into()))
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SyncJob {
        id: row.try_get("id")?,
        case_id: row.try_get("case_id")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown job status: {}", status)))?,
        force_reindex: row.try_get("force_reindex")?,
        cancel_requested: row.try_get("cancel_requested")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        documents_synced: row.try_get("documents_synced")?,
        chunks_created: row.try_get("chunks_created")?,
        error_message: row.try_get("error_message")?,
        metadata_json: row.try_get("metadata_json")?,
        created_at: row.try_get("created_at")?,
        errors: Vec::new(),
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document, StoreError> {
    Ok(Document {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        content_type: row.try_get("content_type")?,
        byte_size: row.try_get("byte_size")?,
        fingerprint: row.try_get("fingerprint")?,
        storage_path: row.try_get("storage_path")?,
        uploaded_at: row.try_get("uploaded_at")?,
        metadata_json: row.try_get("metadata_json")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk, StoreError> {
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        case_id: row.try_get("case_id")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        embedding: blob.map(|b| blob_to_vec(&b)),
        token_count: row.try_get("token_count")?,
        metadata_json: row.try_get("metadata_json")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::migrate::run_migrations;

    async fn test_store() -> Store {
        let pool = connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        Store::new(pool)
    }

    fn sample_document(fingerprint: &str) -> Document {
        Document {
            id: Uuid::new_v4().to_string(),
            name: "triage.txt".to_string(),
            content_type: "text/plain".to_string(),
            byte_size: 42,
            fingerprint: fingerprint.to_string(),
            storage_path: None,
            uploaded_at: Utc::now().timestamp(),
            metadata_json: "{}".to_string(),
        }
    }

    fn sample_chunk(document_id: &str, case_id: i64, index: i64) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            case_id,
            chunk_index: index,
            text: format!("chunk {}", index),
            embedding: Some(vec![0.5; 4]),
            token_count: 2,
            metadata_json: "{}".to_string(),
            created_at: Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn job_lifecycle_round_trips() {
        let store = test_store().await;
        let job = store.create_job(7, false, "{}").await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        store.mark_running(&job.id).await.unwrap();
        store
            .append_error(&job.id, "11", SyncStage::Extract, "bad xref")
            .await
            .unwrap();
        store
            .append_error(&job.id, "12", SyncStage::Fetch, "timeout")
            .await
            .unwrap();
        store
            .finish_job(&job.id, JobStatus::CompletedWithErrors, 3, 17, None)
            .await
            .unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::CompletedWithErrors);
        assert_eq!(loaded.documents_synced, 3);
        assert_eq!(loaded.chunks_created, 17);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        // Error log preserves append order
        assert_eq!(loaded.errors.len(), 2);
        assert_eq!(loaded.errors[0].evidence_id, "11");
        assert_eq!(loaded.errors[0].stage, SyncStage::Extract);
        assert_eq!(loaded.errors[1].evidence_id, "12");
    }

    #[tokio::test]
    async fn cancel_only_applies_to_live_jobs() {
        let store = test_store().await;
        let job = store.create_job(7, false, "{}").await.unwrap();

        assert!(store.request_cancel(&job.id).await.unwrap());
        assert!(store.cancel_requested(&job.id).await.unwrap());

        store
            .finish_job(&job.id, JobStatus::Completed, 0, 0, None)
            .await
            .unwrap();
        assert!(!store.request_cancel("no-such-job").await.unwrap());

        let done = store.create_job(8, false, "{}").await.unwrap();
        store
            .finish_job(&done.id, JobStatus::Failed, 0, 0, Some("boom"))
            .await
            .unwrap();
        assert!(!store.request_cancel(&done.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_case_and_status() {
        let store = test_store().await;
        let a = store.create_job(1, false, "{}").await.unwrap();
        let b = store.create_job(2, false, "{}").await.unwrap();
        store
            .finish_job(&b.id, JobStatus::Completed, 0, 0, None)
            .await
            .unwrap();

        let case_1 = store.list_jobs(Some(1), None, 50).await.unwrap();
        assert_eq!(case_1.len(), 1);
        assert_eq!(case_1[0].id, a.id);

        let completed = store
            .list_jobs(None, Some(JobStatus::Completed), 50)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, b.id);
    }

    #[tokio::test]
    async fn document_and_chunks_persist_atomically() {
        let store = test_store().await;
        let doc = sample_document("fp-1");
        let chunks: Vec<Chunk> = (0..3).map(|i| sample_chunk(&doc.id, 7, i)).collect();

        let outcome = store
            .insert_document_with_chunks(&doc, &chunks)
            .await
            .unwrap();
        assert!(matches!(outcome, PersistOutcome::Inserted));

        let found = store
            .find_document_by_fingerprint("fp-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, doc.id);

        let stored = store.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].chunk_index, 0);
        assert_eq!(stored[0].embedding.as_deref(), Some(&[0.5f32; 4][..]));
    }

    #[tokio::test]
    async fn fingerprint_race_returns_the_winner() {
        let store = test_store().await;
        let winner = sample_document("fp-dup");
        store
            .insert_document_with_chunks(&winner, &[sample_chunk(&winner.id, 1, 0)])
            .await
            .unwrap();

        let loser = sample_document("fp-dup");
        let outcome = store
            .insert_document_with_chunks(&loser, &[sample_chunk(&loser.id, 2, 0)])
            .await
            .unwrap();

        match outcome {
            PersistOutcome::RaceLost(doc) => assert_eq!(doc.id, winner.id),
            other => panic!("expected RaceLost, got {:?}", other),
        }
        // The loser's chunks were never written
        assert!(store.chunks_for_document(&loser.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn case_links_are_idempotent() {
        let store = test_store().await;
        let doc = sample_document("fp-link");
        store
            .insert_document_with_chunks(&doc, &[])
            .await
            .unwrap();

        assert!(store.link_case_document(7, &doc.id).await.unwrap());
        assert!(!store.link_case_document(7, &doc.id).await.unwrap());
        assert!(store.link_case_document(8, &doc.id).await.unwrap());

        assert_eq!(store.count_documents_for_case(7).await.unwrap(), 1);
        assert_eq!(store.count_documents_for_case(8).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replace_chunks_swaps_the_whole_set() {
        let store = test_store().await;
        let doc = sample_document("fp-replace");
        let old: Vec<Chunk> = (0..4).map(|i| sample_chunk(&doc.id, 7, i)).collect();
        store.insert_document_with_chunks(&doc, &old).await.unwrap();

        let new: Vec<Chunk> = (0..2).map(|i| sample_chunk(&doc.id, 7, i)).collect();
        store.replace_chunks(&doc.id, &new).await.unwrap();

        let stored = store.chunks_for_document(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].id, new[1].id);
    }
}
