//! Bookkeeping for whole-file and chunked uploads.
//!
//! Every mutation runs in one transaction whose first statement is a write on
//! the session row. SQLite hands out its write lock on that statement, so the
//! row read back under it cannot change until commit and concurrent callers
//! queue on the busy timeout. Counter updates computed from that row never
//! lose an increment.

use chrono::{DateTime, Duration, Utc};
use sanitize_filename::sanitize;
use serde::Serialize;
use sqlx::SqliteConnection;

use crate::config::Config;
use crate::db::Db;
use crate::errors::ApiError;
use crate::models::chunk::{ChunkManifest, ChunkStatus, UploadChunk};
use crate::models::upload::{ProgressSnapshot, UploadSession, UploadStatus};

/// Limits applied when sessions are created and retried.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub public_base_url: String,
    pub max_file_size: i64,
    pub max_chunks: i64,
    pub max_retries: i64,
}

impl From<&Config> for UploadPolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            public_base_url: cfg.public_base_url.clone(),
            max_file_size: cfg.max_file_size,
            max_chunks: cfg.max_chunks,
            max_retries: cfg.max_retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub total_chunks: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: i64,
    pub chunk_size: i64,
    pub checksum: Option<String>,
    pub locator: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub chunk: UploadChunk,
    pub session: UploadSession,
}

#[derive(Clone)]
pub struct UploadManager {
    db: Db,
    policy: UploadPolicy,
}

impl UploadManager {
    pub fn new(db: Db, policy: UploadPolicy) -> Self {
        Self { db, policy }
    }

    pub async fn initiate(&self, owner: &str, req: NewUpload) -> Result<UploadSession, ApiError> {
        let filename = sanitize(req.filename.trim());
        if filename.is_empty() {
            return Err(ApiError::Validation("filename is required".into()));
        }
        let mime_type = req.mime_type.trim();
        if mime_type.is_empty() {
            return Err(ApiError::Validation("mime type is required".into()));
        }
        if req.file_size <= 0 {
            return Err(ApiError::Validation("file size must be positive".into()));
        }
        if req.file_size > self.policy.max_file_size {
            return Err(ApiError::Validation(format!(
                "file size exceeds limit of {} bytes",
                self.policy.max_file_size
            )));
        }
        if let Some(total) = req.total_chunks {
            if total < 1 || total > self.policy.max_chunks {
                return Err(ApiError::Validation(format!(
                    "total chunks must be between 1 and {}",
                    self.policy.max_chunks
                )));
            }
            if total > req.file_size {
                return Err(ApiError::Validation("more chunks than bytes".into()));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_sessions(id, user_id, filename, file_size, mime_type, total_chunks, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id).bind(owner).bind(&filename).bind(req.file_size).bind(mime_type)
        .bind(req.total_chunks).bind(UploadStatus::Pending.as_str()).bind(now).bind(now)
        .execute(&self.db.0)
        .await?;

        log::info!(
            "Upload: initiate id={} user={} size={} chunks={:?}",
            id, owner, req.file_size, req.total_chunks
        );
        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<UploadSession, ApiError> {
        let row = sqlx::query("SELECT * FROM upload_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db.0)
            .await?;
        let row = row.ok_or(ApiError::NotFound)?;
        UploadSession::from_row(&row)
    }

    /// Newest first.
    pub async fn list_for_owner(
        &self,
        owner: &str,
        status: Option<UploadStatus>,
    ) -> Result<Vec<UploadSession>, ApiError> {
        let status = status.map(UploadStatus::as_str);
        let rows = sqlx::query(
            "SELECT * FROM upload_sessions WHERE user_id = ? AND (? IS NULL OR status = ?)
             ORDER BY created_at DESC",
        )
        .bind(owner).bind(status).bind(status)
        .fetch_all(&self.db.0)
        .await?;
        rows.iter().map(UploadSession::from_row).collect()
    }

    pub async fn record_progress(&self, id: &str, uploaded_bytes: i64) -> Result<UploadSession, ApiError> {
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;

        if session.is_chunked() {
            return Err(ApiError::InvalidState(
                "chunked uploads report progress per chunk".into(),
            ));
        }
        if session.status == UploadStatus::Completed && uploaded_bytes == session.file_size {
            return Ok(session);
        }
        session.ensure_receiving()?;
        if uploaded_bytes < session.uploaded_bytes {
            return Err(ApiError::Validation(format!(
                "uploaded bytes cannot go back from {} to {}",
                session.uploaded_bytes, uploaded_bytes
            )));
        }
        if uploaded_bytes > session.file_size {
            return Err(ApiError::Validation(format!(
                "uploaded bytes exceed file size of {}",
                session.file_size
            )));
        }

        let now = Utc::now();
        session.uploaded_bytes = uploaded_bytes;
        session.progress = session.computed_progress();
        if session.progress >= 100.0 {
            self.finish(&mut session, None, now)?;
        } else {
            session.transition(UploadStatus::Uploading, now)?;
        }
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;

        if session.status == UploadStatus::Completed {
            log::info!("Upload: completed id={} user={}", session.id, session.user_id);
        }
        Ok(session)
    }

    pub async fn record_chunk(&self, id: &str, chunk: NewChunk) -> Result<ChunkReceipt, ApiError> {
        if chunk.chunk_size <= 0 {
            return Err(ApiError::Validation("chunk size must be positive".into()));
        }
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;

        let total = session.total_chunks.ok_or_else(|| {
            ApiError::InvalidState("upload was not started as a chunked upload".into())
        })?;
        if chunk.chunk_index < 0 || chunk.chunk_index >= total {
            return Err(ApiError::Validation(format!(
                "chunk index {} outside 0..{}",
                chunk.chunk_index, total
            )));
        }

        if let Some(existing) = fetch_chunk(&mut tx, id, chunk.chunk_index).await? {
            if existing.is_replay_of(chunk.chunk_size, chunk.checksum.as_deref()) {
                log::debug!("Upload: chunk replay id={} index={}", id, chunk.chunk_index);
                return Ok(ChunkReceipt { chunk: existing, session });
            }
            return Err(ApiError::Validation(format!(
                "chunk {} already recorded with different contents",
                chunk.chunk_index
            )));
        }

        session.ensure_receiving()?;
        if chunk.chunk_size > session.file_size {
            return Err(ApiError::Validation(format!(
                "chunk size exceeds file size of {}",
                session.file_size
            )));
        }
        let uploaded_bytes = session
            .uploaded_bytes
            .checked_add(chunk.chunk_size)
            .ok_or_else(|| ApiError::Validation("chunk size out of range".into()))?;
        if uploaded_bytes > session.file_size {
            return Err(ApiError::Validation(format!(
                "chunks exceed file size of {}",
                session.file_size
            )));
        }
        let chunks_uploaded = session.chunks_uploaded + 1;
        if chunks_uploaded == total && uploaded_bytes != session.file_size {
            return Err(ApiError::Validation(format!(
                "chunks add up to {} bytes, expected {}",
                uploaded_bytes, session.file_size
            )));
        }

        let now = Utc::now();
        let chunk_id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO upload_chunks(id, session_id, chunk_index, chunk_size, checksum, locator, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id).bind(id).bind(chunk.chunk_index).bind(chunk.chunk_size)
        .bind(&chunk.checksum).bind(&chunk.locator).bind(ChunkStatus::Uploaded.as_str()).bind(now)
        .execute(&mut *tx)
        .await?;

        session.chunks_uploaded = chunks_uploaded;
        session.uploaded_bytes = uploaded_bytes;
        session.progress = session.computed_progress();
        if chunks_uploaded >= total {
            self.finish(&mut session, None, now)?;
        } else {
            session.transition(UploadStatus::Uploading, now)?;
        }
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;

        if session.status == UploadStatus::Completed {
            log::info!(
                "Upload: completed id={} user={} chunks={}",
                session.id, session.user_id, total
            );
        }
        let chunk = UploadChunk {
            id: chunk_id,
            session_id: id.to_string(),
            chunk_index: chunk.chunk_index,
            chunk_size: chunk.chunk_size,
            checksum: chunk.checksum,
            locator: chunk.locator,
            status: ChunkStatus::Uploaded,
            created_at: now,
            verified_at: None,
        };
        Ok(ChunkReceipt { chunk, session })
    }

    /// Finalizes with the assembled file's URL and drops the chunk rows.
    pub async fn complete_chunked_upload(&self, id: &str, result_url: &str) -> Result<UploadSession, ApiError> {
        let result_url = result_url.trim();
        if result_url.is_empty() {
            return Err(ApiError::Validation("result url is required".into()));
        }
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;

        let now = Utc::now();
        if session.status != UploadStatus::Completed {
            self.finish(&mut session, Some(result_url), now)?;
        } else {
            session.result_url = Some(result_url.to_string());
        }
        if let Some(total) = session.total_chunks {
            session.chunks_uploaded = total;
        }
        session.uploaded_bytes = session.file_size;
        delete_chunks(&mut tx, id).await?;
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;

        log::info!("Upload: finalized id={} user={}", session.id, session.user_id);
        Ok(session)
    }

    pub async fn fail(&self, id: &str, error_message: &str) -> Result<UploadSession, ApiError> {
        let error_message = error_message.trim();
        if error_message.is_empty() {
            return Err(ApiError::Validation("error message is required".into()));
        }
        self.mutate(id, |session, now| {
            session.transition(UploadStatus::Failed, now)?;
            session.error_message = Some(error_message.to_string());
            Ok(())
        })
        .await
        .inspect(|s| log::warn!("Upload: failed id={} user={} error={:?}", s.id, s.user_id, error_message))
    }

    /// Restarts a failed upload from zero; stale chunk rows are removed so the
    /// counters and the chunk table agree.
    pub async fn retry(&self, id: &str) -> Result<UploadSession, ApiError> {
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;

        if session.status != UploadStatus::Failed {
            return Err(ApiError::InvalidState(format!(
                "only failed uploads can be retried, upload is {}",
                session.status
            )));
        }
        if session.retry_count >= self.policy.max_retries {
            return Err(ApiError::InvalidState(format!(
                "retry limit of {} reached",
                self.policy.max_retries
            )));
        }

        let now = Utc::now();
        session.transition(UploadStatus::Pending, now)?;
        session.retry_count += 1;
        session.uploaded_bytes = 0;
        session.chunks_uploaded = 0;
        session.progress = 0.0;
        session.error_message = None;
        delete_chunks(&mut tx, id).await?;
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;

        log::info!(
            "Upload: retry id={} user={} attempt={}",
            session.id, session.user_id, session.retry_count
        );
        Ok(session)
    }

    pub async fn cancel(&self, id: &str) -> Result<UploadSession, ApiError> {
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;

        let now = Utc::now();
        session.transition(UploadStatus::Cancelled, now)?;
        let removed = delete_chunks(&mut tx, id).await?;
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;

        log::info!(
            "Upload: cancelled id={} user={} chunks_removed={}",
            session.id, session.user_id, removed
        );
        Ok(session)
    }

    pub async fn pause(&self, id: &str) -> Result<UploadSession, ApiError> {
        self.mutate(id, |session, now| session.transition(UploadStatus::Paused, now))
            .await
    }

    pub async fn resume(&self, id: &str) -> Result<UploadSession, ApiError> {
        self.mutate(id, |session, now| {
            if session.status != UploadStatus::Paused {
                return Err(ApiError::InvalidState(format!(
                    "only paused uploads can be resumed, upload is {}",
                    session.status
                )));
            }
            session.transition(UploadStatus::Uploading, now)
        })
        .await
    }

    pub async fn get_progress(&self, id: &str) -> Result<ProgressSnapshot, ApiError> {
        Ok(self.get(id).await?.snapshot())
    }

    pub async fn list_chunks(&self, id: &str) -> Result<Vec<UploadChunk>, ApiError> {
        let rows = sqlx::query("SELECT * FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index")
            .bind(id)
            .fetch_all(&self.db.0)
            .await?;
        rows.iter().map(UploadChunk::from_row).collect()
    }

    pub async fn chunk_manifest(&self, session: &UploadSession) -> Result<ChunkManifest, ApiError> {
        let total = session.total_chunks.ok_or_else(|| {
            ApiError::InvalidState("upload was not started as a chunked upload".into())
        })?;
        let chunks = self.list_chunks(&session.id).await?;
        Ok(ChunkManifest::build(total, &chunks))
    }

    /// Compares `checksum` with the stored one and flags the chunk. A chunk
    /// recorded without a checksum adopts the given one.
    pub async fn verify_chunk(&self, id: &str, chunk_index: i64, checksum: &str) -> Result<UploadChunk, ApiError> {
        let checksum = checksum.trim();
        if checksum.is_empty() {
            return Err(ApiError::Validation("checksum is required".into()));
        }
        let mut tx = self.db.0.begin().await?;
        lock_session(&mut tx, id).await?;
        let mut chunk = fetch_chunk(&mut tx, id, chunk_index)
            .await?
            .ok_or(ApiError::NotFound)?;

        let now = Utc::now();
        chunk.status = match chunk.checksum.as_deref() {
            Some(stored) if stored == checksum => ChunkStatus::Verified,
            Some(_) => ChunkStatus::Invalid,
            None => {
                chunk.checksum = Some(checksum.to_string());
                ChunkStatus::Verified
            }
        };
        chunk.verified_at = Some(now);
        sqlx::query("UPDATE upload_chunks SET status = ?, checksum = ?, verified_at = ? WHERE id = ?")
            .bind(chunk.status.as_str()).bind(&chunk.checksum).bind(now).bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if chunk.status == ChunkStatus::Invalid {
            log::warn!("Upload: chunk checksum mismatch id={} index={}", id, chunk_index);
        }
        Ok(chunk)
    }

    /// Removes finished sessions (and their chunks) last touched before
    /// `older_than_days` ago. Returns the number of sessions removed.
    pub async fn cleanup_older_than(&self, older_than_days: u32) -> Result<u64, ApiError> {
        // Past the representable range nothing can be old enough.
        let cutoff = Duration::try_days(i64::from(older_than_days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff).await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ApiError> {
        let mut tx = self.db.0.begin().await?;
        let chunks = sqlx::query(
            "DELETE FROM upload_chunks WHERE session_id IN
             (SELECT id FROM upload_sessions
              WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let sessions = sqlx::query(
            "DELETE FROM upload_sessions
             WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        log::info!(
            "Upload: cleanup cutoff={} sessions={} chunks={}",
            cutoff, sessions.rows_affected(), chunks.rows_affected()
        );
        Ok(sessions.rows_affected())
    }

    /// Lock, apply `f`, save. `f` runs against the locked row.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<UploadSession, ApiError>
    where
        F: FnOnce(&mut UploadSession, DateTime<Utc>) -> Result<(), ApiError>,
    {
        let mut tx = self.db.0.begin().await?;
        let mut session = lock_session(&mut tx, id).await?;
        let now = Utc::now();
        f(&mut session, now)?;
        save_session(&mut tx, &mut session, now).await?;
        tx.commit().await?;
        Ok(session)
    }

    fn finish(
        &self,
        session: &mut UploadSession,
        result_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        session.transition(UploadStatus::Completed, now)?;
        session.result_url = Some(match result_url {
            Some(url) => url.to_string(),
            None => self.default_result_url(session),
        });
        Ok(())
    }

    fn default_result_url(&self, session: &UploadSession) -> String {
        format!(
            "{}/files/{}/{}",
            self.policy.public_base_url.trim_end_matches('/'),
            session.id,
            session.filename
        )
    }
}

/// Takes the database write lock via a no-op write on the row, then returns
/// the row as seen under that lock.
async fn lock_session(conn: &mut SqliteConnection, id: &str) -> Result<UploadSession, ApiError> {
    let row = sqlx::query("UPDATE upload_sessions SET version = version WHERE id = ? RETURNING *")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let row = row.ok_or(ApiError::NotFound)?;
    UploadSession::from_row(&row)
}

async fn save_session(
    conn: &mut SqliteConnection,
    session: &mut UploadSession,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    session.updated_at = now;
    session.version += 1;
    sqlx::query(
        "UPDATE upload_sessions SET chunks_uploaded = ?, uploaded_bytes = ?, progress = ?, status = ?,
         error_message = ?, result_url = ?, retry_count = ?, version = ?, updated_at = ?,
         completed_at = ?, failed_at = ?, cancelled_at = ?
         WHERE id = ?",
    )
    .bind(session.chunks_uploaded).bind(session.uploaded_bytes).bind(session.progress)
    .bind(session.status.as_str()).bind(&session.error_message).bind(&session.result_url)
    .bind(session.retry_count).bind(session.version).bind(now)
    .bind(session.completed_at).bind(session.failed_at).bind(session.cancelled_at)
    .bind(&session.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn fetch_chunk(
    conn: &mut SqliteConnection,
    session_id: &str,
    chunk_index: i64,
) -> Result<Option<UploadChunk>, ApiError> {
    let row = sqlx::query("SELECT * FROM upload_chunks WHERE session_id = ? AND chunk_index = ?")
        .bind(session_id)
        .bind(chunk_index)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(UploadChunk::from_row).transpose()
}

async fn delete_chunks(conn: &mut SqliteConnection, session_id: &str) -> Result<u64, ApiError> {
    let res = sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *conn)
        .await?;
    Ok(res.rows_affected())
}
