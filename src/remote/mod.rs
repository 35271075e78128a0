use async_trait::async_trait;

use crate::error::SubmitError;

pub mod http;
pub mod payload;

pub use http::HttpSubmissionService;
pub use payload::{
    parse_batch_ack, BatchAck, BatchEntry, BatchPayload, RecordAck, SingleRecordPayload,
    WorkerAck,
};

/// The server that records attendance. It upserts by (worker, project, date),
/// so submitting the same record twice is harmless.
#[async_trait]
pub trait SubmissionService: Send + Sync {
    /// Submits one (project, date) group. `Ok` means a 2xx response.
    async fn submit_batch(&self, payload: &BatchPayload) -> Result<BatchAck, SubmitError>;

    /// Submits one record. `Ok` means a 2xx response.
    async fn submit_single(&self, payload: &SingleRecordPayload) -> Result<(), SubmitError>;
}
