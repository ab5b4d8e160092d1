use examgate_core::CandidateRecord;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record has an empty email key")]
    InvalidKey,
    #[error("exam number {exam_number} already belongs to another candidate")]
    ExamNumberTaken { exam_number: String },
    #[error("stored record for {email} is unreadable: {source}")]
    Corrupt {
        email: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
}

/// Keyed candidate collection.
///
/// `put` is a full-record upsert: there are no partial updates, callers do
/// read-modify-write. Writes to one key are atomic and last-write-wins.
pub trait CandidateStore: Send + Sync + 'static {
    /// Insert or fully replace the record at `record.email`.
    fn put(&self, record: CandidateRecord) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(
        &self,
        email: &str,
    ) -> impl Future<Output = Result<Option<CandidateRecord>, StoreError>> + Send;

    /// Every record, in first-insertion order.
    fn get_all(&self) -> impl Future<Output = Result<Vec<CandidateRecord>, StoreError>> + Send;

    /// Remove the record at `email`. Absent keys are not an error.
    fn delete(&self, email: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}
