// Drains the local attendance queue against the remote server.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::SubmissionMode;
use crate::connectivity::ConnectivityMonitor;
use crate::database::LocalStore;
use crate::error::{StoreError, SubmitError};
use crate::models::{AttendanceRecord, LocalId, NewAttendance, SyncState};
use crate::remote::{
    BatchAck, BatchPayload, RecordAck, SingleRecordPayload, SubmissionService,
};
use crate::sync::events::{CycleReport, EventBus, SyncEvent, TriggerReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was running; it will run once more before releasing.
    Coalesced,
}

pub struct SyncEngine {
    store: LocalStore,
    service: Arc<dyn SubmissionService>,
    monitor: ConnectivityMonitor,
    mode: SubmissionMode,
    events: EventBus,
    cycle_lock: Mutex<()>,
    rerun_requested: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        service: Arc<dyn SubmissionService>,
        monitor: ConnectivityMonitor,
        mode: SubmissionMode,
    ) -> Self {
        Self {
            store,
            service,
            monitor,
            mode,
            events: EventBus::new(),
            cycle_lock: Mutex::new(()),
            rerun_requested: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Entry point for the capture layer: persists the record, then notifies.
    /// The record is offline-safe once this returns `Ok`.
    pub async fn enqueue(&self, record: &NewAttendance) -> Result<LocalId, StoreError> {
        let local_id = self.store.append(record).await?;
        self.events.emit(SyncEvent::Queued {
            local_id,
            worker_id: record.worker_id.clone(),
        });
        Ok(local_id)
    }

    /// Runs a cycle unless one is already running, in which case the request
    /// is folded into a follow-up cycle run by the current owner.
    pub async fn request_cycle(&self, trigger: TriggerReason) -> CycleOutcome {
        let mut trigger = trigger;
        let mut report: Option<CycleReport> = None;

        loop {
            let guard = match self.cycle_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.rerun_requested.store(true, Ordering::SeqCst);
                    // The owner may have released between the two checks.
                    match self.cycle_lock.try_lock() {
                        Ok(guard) => guard,
                        Err(_) => {
                            debug!(%trigger, "cycle already running; trigger coalesced");
                            break;
                        }
                    }
                }
            };

            self.rerun_requested.store(false, Ordering::SeqCst);
            let cycle = self.run_cycle(trigger).await;
            drop(guard);

            match report.as_mut() {
                Some(report) => report.absorb(cycle),
                None => report = Some(cycle),
            }

            if !self.rerun_requested.load(Ordering::SeqCst) {
                break;
            }
            trigger = TriggerReason::Coalesced;
        }

        match report {
            Some(report) => CycleOutcome::Completed(report),
            None => CycleOutcome::Coalesced,
        }
    }

    /// Runs one cycle under the store's cycle lease. The in-process lock
    /// keeps this engine's cycles apart; the lease does the same for other
    /// processes sharing the database file.
    async fn run_cycle(&self, trigger: TriggerReason) -> CycleReport {
        let mut report = CycleReport::new(trigger);

        match self.store.try_acquire_cycle_lease().await {
            Ok(true) => {}
            Ok(false) => {
                info!(%trigger, "another process is synchronizing; cycle skipped");
                report.held_elsewhere = true;
                return report;
            }
            Err(e) => {
                error!(error = %e, "failed to acquire cycle lease");
                report.store_errors += 1;
                return report;
            }
        }

        let report = self.run_leased_cycle(report).await;

        if let Err(e) = self.store.release_cycle_lease().await {
            // It expires on its own; until then other processes wait.
            warn!(error = %e, "failed to release cycle lease");
        }
        report
    }

    async fn run_leased_cycle(&self, mut report: CycleReport) -> CycleReport {
        let started = Instant::now();
        let trigger = report.trigger;

        // With the lease held, anything still in flight was orphaned by a
        // crash or a failed store write.
        match self.store.recover_interrupted().await {
            Ok(0) => {}
            Ok(recovered) => warn!(recovered, "recovered interrupted submissions"),
            Err(e) => {
                error!(error = %e, "failed to recover interrupted submissions");
                report.store_errors += 1;
            }
        }
        if let Err(e) = self.store.rearm_failed().await {
            error!(error = %e, "failed to re-arm failed records");
            report.store_errors += 1;
        }

        let snapshot: Vec<AttendanceRecord> = match self.store.list_pending().await {
            Ok(records) => records
                .into_iter()
                .filter(|record| record.sync_state.can_transition_to(&SyncState::InFlight))
                .collect(),
            Err(e) => {
                error!(error = %e, "failed to read pending records");
                report.store_errors += 1;
                return report;
            }
        };

        if snapshot.is_empty() {
            debug!(%trigger, "nothing to synchronize");
            return report;
        }

        info!(%trigger, pending = snapshot.len(), "sync cycle started");
        self.events.emit(SyncEvent::CycleStarted {
            trigger,
            pending: snapshot.len(),
        });

        let units = partition(snapshot, self.mode);
        for (index, unit) in units.iter().enumerate() {
            if !self.monitor.is_online() {
                report.skipped_offline = units[index..].iter().map(Vec::len).sum();
                info!(
                    skipped = report.skipped_offline,
                    "connection lost; remaining records deferred"
                );
                break;
            }
            match self.store.try_acquire_cycle_lease().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!("cycle lease lost; remaining records deferred");
                    report.held_elsewhere = true;
                    break;
                }
            }
            self.submit_unit(unit, &mut report).await;
        }

        info!(
            synced = report.synced,
            failed = report.failed,
            rejected = report.rejected,
            deferred = report.skipped_offline,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync cycle finished"
        );
        self.events.emit(SyncEvent::CycleFinished(report.clone()));
        report
    }

    async fn submit_unit(&self, unit: &[AttendanceRecord], report: &mut CycleReport) {
        let ids: Vec<LocalId> = unit.iter().map(|record| record.local_id).collect();
        if let Err(e) = self.store.mark_in_flight(&ids).await {
            error!(error = %e, "failed to mark records in flight; unit skipped");
            report.store_errors += 1;
            return;
        }
        report.attempted += unit.len();

        match self.mode {
            SubmissionMode::Batch => self.submit_batch(unit, report).await,
            SubmissionMode::PerRecord => {
                for record in unit {
                    self.submit_single(record, report).await;
                }
            }
        }
    }

    async fn submit_batch(&self, unit: &[AttendanceRecord], report: &mut CycleReport) {
        let Some(payload) = BatchPayload::from_records(unit) else {
            return;
        };

        match self.service.submit_batch(&payload).await {
            Ok(BatchAck::Aggregate) if unit.len() == 1 => {
                self.settle_synced(&unit[0], report).await;
            }
            Ok(BatchAck::Aggregate) => {
                // "ok" for the whole batch says nothing about each record.
                // Re-verify one by one; the server upserts, so repeats are safe.
                info!(
                    records = unit.len(),
                    "batch acknowledged without per-record results; re-verifying individually"
                );
                for record in unit {
                    if self.monitor.is_online() {
                        self.submit_single(record, report).await;
                    } else {
                        let error = SubmitError::AmbiguousAcknowledgment(
                            "batch acknowledged without detail; offline before re-verification"
                                .to_string(),
                        );
                        self.settle_failed(record, &error, report).await;
                    }
                }
            }
            Ok(ack) => {
                for record in unit {
                    match ack.for_worker(&record.worker_id) {
                        Some(RecordAck::Accepted) => self.settle_synced(record, report).await,
                        Some(RecordAck::Rejected(message)) => {
                            let error = SubmitError::RecordRejected(message.clone());
                            self.settle_failed(record, &error, report).await;
                        }
                        None => {
                            let error = SubmitError::AmbiguousAcknowledgment(format!(
                                "no result for worker {}",
                                record.worker_id
                            ));
                            self.settle_failed(record, &error, report).await;
                        }
                    }
                }
            }
            Err(error) => {
                warn!(error = %error, records = unit.len(), "batch submission failed");
                for record in unit {
                    self.settle_failed(record, &error, report).await;
                }
            }
        }
    }

    async fn submit_single(&self, record: &AttendanceRecord, report: &mut CycleReport) {
        let payload = SingleRecordPayload::from(record);
        match self.service.submit_single(&payload).await {
            Ok(()) => self.settle_synced(record, report).await,
            Err(error) => {
                warn!(local_id = %record.local_id, error = %error, "submission failed");
                self.settle_failed(record, &error, report).await;
            }
        }
    }

    async fn settle_synced(&self, record: &AttendanceRecord, report: &mut CycleReport) {
        match self.store.mark_synced(record.local_id).await {
            Ok(()) => {
                report.synced += 1;
                self.events.emit(SyncEvent::Synced {
                    local_id: record.local_id,
                    worker_id: record.worker_id.clone(),
                });
            }
            Err(e) => {
                // Left in flight; the next cycle recovers and resubmits it.
                error!(
                    local_id = %record.local_id,
                    error = %e,
                    "failed to remove acknowledged record"
                );
                report.store_errors += 1;
            }
        }
    }

    async fn settle_failed(
        &self,
        record: &AttendanceRecord,
        error: &SubmitError,
        report: &mut CycleReport,
    ) {
        match self.store.mark_failed(record.local_id, error).await {
            Ok(SyncState::Failed {
                retryable: false,
                last_error,
            }) => {
                report.rejected += 1;
                warn!(
                    local_id = %record.local_id,
                    error = %last_error,
                    "record rejected; manual resolution required"
                );
                self.events.emit(SyncEvent::Rejected {
                    local_id: record.local_id,
                    worker_id: record.worker_id.clone(),
                    error: last_error,
                });
            }
            Ok(_) => {
                report.failed += 1;
                self.events.emit(SyncEvent::Failed {
                    local_id: record.local_id,
                    worker_id: record.worker_id.clone(),
                    error: error.to_string(),
                });
            }
            Err(e) => {
                error!(
                    local_id = %record.local_id,
                    error = %e,
                    "failed to record submission failure"
                );
                report.store_errors += 1;
            }
        }
    }
}

/// Splits a snapshot into submission units, preserving creation order.
/// Batch mode groups by (project, date) because the batch body carries one
/// of each.
pub fn partition(
    records: Vec<AttendanceRecord>,
    mode: SubmissionMode,
) -> Vec<Vec<AttendanceRecord>> {
    match mode {
        SubmissionMode::PerRecord => records.into_iter().map(|record| vec![record]).collect(),
        SubmissionMode::Batch => {
            let mut units: Vec<Vec<AttendanceRecord>> = Vec::new();
            let mut index: HashMap<(String, NaiveDate), usize> = HashMap::new();
            for record in records {
                let key = (record.project_id.clone(), record.date);
                match index.get(&key) {
                    Some(&position) => units[position].push(record),
                    None => {
                        index.insert(key, units.len());
                        units.push(vec![record]);
                    }
                }
            }
            units
        }
    }
}
