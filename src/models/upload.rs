use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::str::FromStr;

use crate::errors::ApiError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Cancelled)
    }

    /// The single transition table for upload sessions.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Uploading, Uploading)
                | (Uploading, Paused)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, Cancelled)
                | (Paused, Uploading)
                | (Paused, Failed)
                | (Paused, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "paused" => Ok(UploadStatus::Paused),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            "cancelled" => Ok(UploadStatus::Cancelled),
            other => Err(ApiError::Validation(format!("unknown upload status '{other}'"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub total_chunks: Option<i64>,
    pub chunks_uploaded: i64,
    pub uploaded_bytes: i64,
    pub progress: f64,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub result_url: Option<String>,
    pub retry_count: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn from_row(r: &SqliteRow) -> Result<Self, ApiError> {
        let status: String = r.try_get("status")?;
        let status: UploadStatus = status.parse().map_err(|_| {
            log::error!("upload row has unknown status '{status}'");
            ApiError::Internal
        })?;
        Ok(Self {
            id: r.try_get("id")?,
            user_id: r.try_get("user_id")?,
            filename: r.try_get("filename")?,
            file_size: r.try_get("file_size")?,
            mime_type: r.try_get("mime_type")?,
            total_chunks: r.try_get("total_chunks")?,
            chunks_uploaded: r.try_get("chunks_uploaded")?,
            uploaded_bytes: r.try_get("uploaded_bytes")?,
            progress: r.try_get("progress")?,
            status,
            error_message: r.try_get("error_message")?,
            result_url: r.try_get("result_url")?,
            retry_count: r.try_get("retry_count")?,
            version: r.try_get("version")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
            completed_at: r.try_get("completed_at")?,
            failed_at: r.try_get("failed_at")?,
            cancelled_at: r.try_get("cancelled_at")?,
        })
    }

    pub fn is_chunked(&self) -> bool {
        self.total_chunks.is_some()
    }

    /// Percent derived from the counters rather than the stored column.
    pub fn computed_progress(&self) -> f64 {
        if self.status == UploadStatus::Completed {
            return 100.0;
        }
        let pct = match self.total_chunks {
            Some(total) if total > 0 => self.chunks_uploaded as f64 / total as f64 * 100.0,
            Some(_) => 0.0,
            None => self.uploaded_bytes as f64 / self.file_size as f64 * 100.0,
        };
        pct.clamp(0.0, 100.0)
    }

    /// Moves to `next` if the transition table allows it and stamps the
    /// matching timestamp.
    pub fn transition(&mut self, next: UploadStatus, now: DateTime<Utc>) -> Result<(), ApiError> {
        if self.status.is_terminal() {
            return Err(ApiError::InvalidState(format!("upload is already {}", self.status)));
        }
        if !self.status.can_transition_to(next) {
            return Err(ApiError::InvalidState(format!(
                "cannot move upload from {} to {}",
                self.status, next
            )));
        }
        self.status = next;
        match next {
            UploadStatus::Completed => {
                self.completed_at = Some(now);
                self.progress = 100.0;
            }
            UploadStatus::Failed => self.failed_at = Some(now),
            UploadStatus::Cancelled => self.cancelled_at = Some(now),
            UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Paused => {}
        }
        Ok(())
    }

    /// Progress reports and chunks are only taken while data is flowing.
    pub fn ensure_receiving(&self) -> Result<(), ApiError> {
        match self.status {
            UploadStatus::Pending | UploadStatus::Uploading => Ok(()),
            other => Err(ApiError::InvalidState(format!("upload is {other}"))),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            file_size: self.file_size,
            uploaded_bytes: self.uploaded_bytes,
            progress_percent: self.computed_progress(),
            total_chunks: self.total_chunks,
            chunks_uploaded: self.chunks_uploaded,
            status: self.status,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub file_size: i64,
    pub uploaded_bytes: i64,
    pub progress_percent: f64,
    pub total_chunks: Option<i64>,
    pub chunks_uploaded: i64,
    pub status: UploadStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use UploadStatus::*;

    const ALL: [UploadStatus; 6] = [Pending, Uploading, Paused, Completed, Failed, Cancelled];

    fn session(total_chunks: Option<i64>) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: "s1".into(),
            user_id: "u1".into(),
            filename: "a.zip".into(),
            file_size: 1000,
            mime_type: "application/zip".into(),
            total_chunks,
            chunks_uploaded: 0,
            uploaded_bytes: 0,
            progress: 0.0,
            status: Pending,
            error_message: None,
            result_url: None,
            retry_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn every_live_state_can_be_cancelled() {
        for from in [Pending, Uploading, Paused, Failed] {
            assert!(from.can_transition_to(Cancelled), "{from}");
        }
    }

    #[test]
    fn failed_only_leaves_through_retry_or_cancel() {
        let exits: Vec<_> = ALL.into_iter().filter(|to| Failed.can_transition_to(*to)).collect();
        assert_eq!(exits, vec![Pending, Cancelled]);
    }

    #[test]
    fn pause_only_from_uploading() {
        let sources: Vec<_> = ALL.into_iter().filter(|from| from.can_transition_to(Paused)).collect();
        assert_eq!(sources, vec![Uploading]);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<UploadStatus>().unwrap(), s);
        }
        assert!("done".parse::<UploadStatus>().is_err());
    }

    #[test]
    fn transition_stamps_timestamps() {
        let now = Utc::now();
        let mut s = session(None);
        s.transition(Uploading, now).unwrap();
        s.transition(Failed, now).unwrap();
        assert_eq!(s.failed_at, Some(now));

        let err = s.transition(Completed, now).unwrap_err();
        assert!(matches!(err, ApiError::InvalidState(_)));
        assert_eq!(s.status, Failed);
    }

    #[test]
    fn computed_progress_ignores_stored_column() {
        let mut s = session(Some(4));
        s.chunks_uploaded = 3;
        s.progress = 12.0;
        assert_eq!(s.computed_progress(), 75.0);

        let mut whole = session(None);
        whole.uploaded_bytes = 250;
        assert_eq!(whole.snapshot().progress_percent, 25.0);

        whole.status = Completed;
        assert_eq!(whole.computed_progress(), 100.0);
    }
}
