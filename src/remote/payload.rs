use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::AttendanceRecord;

/// Body of the batch endpoint: one project and date, many workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchPayload {
    pub project: String,
    pub date: NaiveDate,
    pub asistencias: Vec<BatchEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchEntry {
    pub trabajador: String,
    pub presente: bool,
}

impl BatchPayload {
    /// Callers group records by (project, date) first; the first record
    /// supplies both.
    pub fn from_records(records: &[AttendanceRecord]) -> Option<Self> {
        let first = records.first()?;
        Some(Self {
            project: first.project_id.clone(),
            date: first.date,
            asistencias: records
                .iter()
                .map(|record| BatchEntry {
                    trabajador: record.worker_id.clone(),
                    presente: record.present,
                })
                .collect(),
        })
    }
}

/// Body of the single-record endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleRecordPayload {
    pub trabajador: String,
    pub proyecto: String,
    pub fecha: NaiveDate,
    pub presente: bool,
}

impl From<&AttendanceRecord> for SingleRecordPayload {
    fn from(record: &AttendanceRecord) -> Self {
        Self {
            trabajador: record.worker_id.clone(),
            proyecto: record.project_id.clone(),
            fecha: record.date,
            presente: record.present,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAck {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAck {
    pub worker_id: String,
    pub ack: RecordAck,
}

/// What a 2xx batch response tells us about individual records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAck {
    PerRecord(Vec<WorkerAck>),
    /// Success with no per-record detail.
    Aggregate,
}

impl BatchAck {
    /// Last acknowledgment reported for `worker_id`, if any.
    pub fn for_worker(&self, worker_id: &str) -> Option<&RecordAck> {
        match self {
            BatchAck::PerRecord(acks) => acks
                .iter()
                .rev()
                .find(|entry| entry.worker_id == worker_id)
                .map(|entry| &entry.ack),
            BatchAck::Aggregate => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Option<Vec<BatchResultEntry>>,
}

#[derive(Debug, Deserialize)]
struct BatchResultEntry {
    trabajador: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Interprets the body of a successful batch response.
///
/// The server answers `{"status": "success", "results": [...]}` where each
/// result names a worker and either succeeded or carries an `error`. Anything
/// without a `results` array only acknowledges the batch as a whole.
pub fn parse_batch_ack(body: &str) -> BatchAck {
    let Ok(BatchResponse {
        results: Some(results),
    }) = serde_json::from_str::<BatchResponse>(body)
    else {
        return BatchAck::Aggregate;
    };

    let acks = results
        .into_iter()
        .filter_map(|entry| {
            let worker_id = match entry.trabajador {
                Value::String(id) => id,
                Value::Number(id) => id.to_string(),
                _ => return None,
            };
            let ack = match entry.error {
                Some(error) => RecordAck::Rejected(error),
                None => RecordAck::Accepted,
            };
            Some(WorkerAck { worker_id, ack })
        })
        .collect();

    BatchAck::PerRecord(acks)
}
