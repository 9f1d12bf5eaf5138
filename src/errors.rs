use thiserror::Error;
use uuid::Uuid;

use crate::store::JobStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unsupported database kind: {0}")]
    UnsupportedKind(String),

    #[error("Failed to launch dump tool: {0}")]
    SpawnFailure(String),

    #[error("Dump process failed: {0}")]
    DumpProcess(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Job record not found: {0}")]
    NotFound(Uuid),

    #[error("Illegal job status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid cron expression {expr:?}: {message}")]
    InvalidCronSpec { expr: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
