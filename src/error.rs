use thiserror::Error;

use crate::models::LocalId;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Rejected at append time; never reaches the sync engine.
    #[error("invalid attendance record: {0}")]
    Invalid(String),

    /// The local write did not complete. The record is not offline-safe.
    #[error("failed to persist attendance data: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("record {local_id} cannot move from {from} to {to}")]
    InvalidTransition {
        local_id: LocalId,
        from: &'static str,
        to: &'static str,
    },

    #[error("record {0} not found")]
    NotFound(LocalId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Timeout, refused connection, 5xx. Always retried.
    #[error("transient network error: {0}")]
    Transient(String),

    /// 4xx. Retried a bounded number of times, then left for a human.
    #[error("rejected by server: {message} (HTTP {status})")]
    Rejected { status: u16, message: String },

    /// A 2xx batch response carried an error for this record.
    #[error("rejected by server: {0}")]
    RecordRejected(String),

    /// The server did not say which records it accepted.
    #[error("ambiguous acknowledgment: {0}")]
    AmbiguousAcknowledgment(String),
}

impl SubmitError {
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SubmitError::Rejected { .. } | SubmitError::RecordRejected(_)
        )
    }
}
