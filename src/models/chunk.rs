use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashSet;

use crate::errors::ApiError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Uploaded,
    Verified,
    Invalid,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Uploaded => "uploaded",
            ChunkStatus::Verified => "verified",
            ChunkStatus::Invalid => "invalid",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(ChunkStatus::Uploaded),
            "verified" => Some(ChunkStatus::Verified),
            "invalid" => Some(ChunkStatus::Invalid),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunk {
    pub id: String,
    pub session_id: String,
    pub chunk_index: i64,
    pub chunk_size: i64,
    pub checksum: Option<String>,
    pub locator: Option<String>,
    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl UploadChunk {
    pub fn from_row(r: &SqliteRow) -> Result<Self, ApiError> {
        let status: String = r.try_get("status")?;
        let status = ChunkStatus::parse(&status).ok_or_else(|| {
            log::error!("chunk row has unknown status '{status}'");
            ApiError::Internal
        })?;
        Ok(Self {
            id: r.try_get("id")?,
            session_id: r.try_get("session_id")?,
            chunk_index: r.try_get("chunk_index")?,
            chunk_size: r.try_get("chunk_size")?,
            checksum: r.try_get("checksum")?,
            locator: r.try_get("locator")?,
            status,
            created_at: r.try_get("created_at")?,
            verified_at: r.try_get("verified_at")?,
        })
    }

    /// A resend of this chunk: same size, and the same checksum when the
    /// caller supplies one.
    pub fn is_replay_of(&self, chunk_size: i64, checksum: Option<&str>) -> bool {
        self.chunk_size == chunk_size
            && checksum.map_or(true, |c| self.checksum.as_deref() == Some(c))
    }
}

/// Which chunk indices a resuming client still has to send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkManifest {
    pub total_chunks: i64,
    pub received: Vec<i64>,
    pub missing: Vec<i64>,
}

impl ChunkManifest {
    pub fn build(total_chunks: i64, chunks: &[UploadChunk]) -> Self {
        let received: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        let seen: HashSet<i64> = received.iter().copied().collect();
        let missing = (0..total_chunks).filter(|i| !seen.contains(i)).collect();
        Self { total_chunks, received, missing }
    }
}
