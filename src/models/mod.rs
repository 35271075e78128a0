use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;

pub mod qr;

pub use qr::{worker_id_from_credential_url, worker_id_from_qr};

/// Identity of a record inside the local store. Backed by an AUTOINCREMENT
/// rowid, so it is monotonic and never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Pending,
    InFlight,
    /// Terminal. Synced records are deleted, so the store never returns this.
    Synced,
    Failed { last_error: String, retryable: bool },
}

impl SyncState {
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::InFlight => "in_flight",
            SyncState::Synced => "synced",
            SyncState::Failed { .. } => "failed",
        }
    }

    /// Pending -> InFlight -> {Synced | Failed}, Failed -> Pending.
    pub fn can_transition_to(&self, next: &SyncState) -> bool {
        matches!(
            (self, next),
            (SyncState::Pending, SyncState::InFlight)
                | (SyncState::InFlight, SyncState::Synced)
                | (SyncState::InFlight, SyncState::Failed { .. })
                | (SyncState::Failed { .. }, SyncState::Pending)
        )
    }

    pub fn is_retry_eligible(&self) -> bool {
        match self {
            SyncState::Pending => true,
            SyncState::Failed { retryable, .. } => *retryable,
            SyncState::InFlight | SyncState::Synced => false,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Failed { last_error, retryable: true } => {
                write!(f, "failed (will retry): {}", last_error)
            }
            SyncState::Failed { last_error, retryable: false } => {
                write!(f, "rejected: {}", last_error)
            }
            other => f.write_str(other.label()),
        }
    }
}

/// Attendance event as produced by the capture layer, before it has an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttendance {
    pub worker_id: String,
    pub project_id: String,
    pub date: NaiveDate,
    pub present: bool,
}

impl NewAttendance {
    pub fn new(
        worker_id: impl Into<String>,
        project_id: impl Into<String>,
        date: NaiveDate,
        present: bool,
    ) -> Self {
        Self {
            worker_id: worker_id.into().trim().to_string(),
            project_id: project_id.into().trim().to_string(),
            date,
            present,
        }
    }

    /// Builds a record from raw strings, parsing `date` as `YYYY-MM-DD`.
    pub fn parse(
        worker_id: &str,
        project_id: &str,
        date: &str,
        present: bool,
    ) -> Result<Self, StoreError> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").map_err(|_| {
            StoreError::Invalid(format!("date must be YYYY-MM-DD, got {:?}", date))
        })?;
        let record = Self::new(worker_id, project_id, date, present);
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.worker_id.trim().is_empty() {
            return Err(StoreError::Invalid("worker id is required".to_string()));
        }
        if self.project_id.trim().is_empty() {
            return Err(StoreError::Invalid("project id is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub local_id: LocalId,
    pub worker_id: String,
    pub project_id: String,
    pub date: NaiveDate,
    pub present: bool,
    pub sync_state: SyncState,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub rejections: u32,
}

impl AttendanceRecord {
    /// The triple the server upserts on.
    pub fn natural_key(&self) -> (&str, &str, NaiveDate) {
        (&self.worker_id, &self.project_id, self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(retryable: bool) -> SyncState {
        SyncState::Failed {
            last_error: "boom".to_string(),
            retryable,
        }
    }

    #[test]
    fn permitted_transitions() {
        assert!(SyncState::Pending.can_transition_to(&SyncState::InFlight));
        assert!(SyncState::InFlight.can_transition_to(&SyncState::Synced));
        assert!(SyncState::InFlight.can_transition_to(&failed(true)));
        assert!(failed(true).can_transition_to(&SyncState::Pending));
    }

    #[test]
    fn forbidden_transitions() {
        assert!(!SyncState::Pending.can_transition_to(&SyncState::Synced));
        assert!(!SyncState::Pending.can_transition_to(&failed(true)));
        assert!(!SyncState::Synced.can_transition_to(&SyncState::Pending));
        assert!(!failed(true).can_transition_to(&SyncState::InFlight));
        assert!(!SyncState::InFlight.can_transition_to(&SyncState::Pending));
    }

    #[test]
    fn only_pending_and_retryable_failures_are_eligible() {
        assert!(SyncState::Pending.is_retry_eligible());
        assert!(failed(true).is_retry_eligible());
        assert!(!failed(false).is_retry_eligible());
        assert!(!SyncState::InFlight.is_retry_eligible());
    }

    #[test]
    fn parse_trims_and_validates() {
        let record = NewAttendance::parse(" W1 ", "P1", "2024-01-01", true).unwrap();
        assert_eq!(record.worker_id, "W1");
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        assert!(matches!(
            NewAttendance::parse("", "P1", "2024-01-01", true),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            NewAttendance::parse("W1", "  ", "2024-01-01", true),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            NewAttendance::parse("W1", "P1", "01/01/2024", true),
            Err(StoreError::Invalid(_))
        ));
    }
}
