use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges: Queued -> Processing -> {Completed, Failed, Cancelled}.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next == JobStatus::Processing,
            JobStatus::Processing => next.is_terminal(),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

/// Durable record of one backup job. Once terminal it is immutable and only
/// read thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub subject_name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact_name: String,
    #[serde(default)]
    pub download_reference: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// Crash-tolerant job record persistence over a single JSON file.
///
/// The backing file is a shared resource: every read-modify-write cycle runs
/// under one mutex so concurrent executions cannot interleave and drop each
/// other's update, and the rewrite goes through a temp file + rename so a
/// crash mid-write never leaves a torn table.
pub struct JobRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Allocates an id and appends a `Processing` record.
    pub async fn create(&self, subject_name: &str, artifact_name: &str) -> Result<JobRecord> {
        let record = JobRecord {
            id: Uuid::new_v4(),
            subject_name: subject_name.to_string(),
            status: JobStatus::Processing,
            created_at: Utc::now(),
            completed_at: None,
            artifact_name: artifact_name.to_string(),
            download_reference: None,
            error_detail: None,
        };

        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.push(record.clone());
        self.write_all(&records).await?;
        Ok(record)
    }

    /// Applies a legal state-machine edge together with its terminal fields.
    ///
    /// `Completed` requires a download reference and no error detail;
    /// `Failed` and `Cancelled` require a detail and no reference. A field
    /// combination that violates the record invariant is rejected the same
    /// way as an illegal edge.
    pub async fn transition(
        &self,
        id: Uuid,
        next: JobStatus,
        download_reference: Option<String>,
        error_detail: Option<String>,
    ) -> Result<JobRecord> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(AppError::NotFound(id))?;

        let fields_valid = match next {
            JobStatus::Completed => download_reference.is_some() && error_detail.is_none(),
            JobStatus::Failed | JobStatus::Cancelled => {
                error_detail.is_some() && download_reference.is_none()
            }
            JobStatus::Queued | JobStatus::Processing => {
                download_reference.is_none() && error_detail.is_none()
            }
        };
        if !record.status.can_transition_to(next) || !fields_valid {
            return Err(AppError::InvalidTransition {
                from: record.status,
                to: next,
            });
        }

        record.status = next;
        record.download_reference = download_reference;
        record.error_detail = error_detail;
        if next.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        let updated = record.clone();

        self.write_all(&records).await?;
        Ok(updated)
    }

    /// Conditional cancel used by the cancellation path: applies `Cancelled`
    /// only if the record is still `Processing`. Returns false when the job
    /// already reached a terminal state, leaving that state untouched, so
    /// concurrent cancel requests apply exactly once.
    pub async fn cancel_if_processing(&self, id: Uuid, detail: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(AppError::NotFound(id))?;

        if record.status != JobStatus::Processing {
            return Ok(false);
        }

        record.status = JobStatus::Cancelled;
        record.error_detail = Some(detail.to_string());
        record.completed_at = Some(Utc::now());

        self.write_all(&records).await?;
        Ok(true)
    }

    /// All records, newest first by creation time.
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn read_all(&self) -> Result<Vec<JobRecord>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&contents)?)
    }

    async fn write_all(&self, records: &[JobRecord]) -> Result<()> {
        let contents = serde_json::to_vec_pretty(records)?;
        let tmp_path = temp_path(&self.path);
        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
