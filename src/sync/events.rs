use std::fmt;
use tokio::sync::broadcast;

use crate::models::LocalId;

const EVENT_CAPACITY: usize = 256;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Startup,
    ConnectivityRestored,
    Manual,
    Retry,
    /// Records were appended outside this engine, e.g. by another process.
    QueueChanged,
    /// Follow-up for triggers that arrived while a cycle was running.
    Coalesced,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerReason::Startup => "startup",
            TriggerReason::ConnectivityRestored => "connection restored",
            TriggerReason::Manual => "manual",
            TriggerReason::Retry => "retry",
            TriggerReason::QueueChanged => "new records",
            TriggerReason::Coalesced => "queued trigger",
        })
    }
}

/// Totals for one `request_cycle` call, including any coalesced follow-ups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub trigger: TriggerReason,
    pub cycles: u32,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub rejected: usize,
    pub skipped_offline: usize,
    pub store_errors: usize,
    /// Another process held the cycle lease, so nothing was submitted.
    pub held_elsewhere: bool,
}

impl CycleReport {
    pub fn new(trigger: TriggerReason) -> Self {
        Self {
            trigger,
            cycles: 1,
            attempted: 0,
            synced: 0,
            failed: 0,
            rejected: 0,
            skipped_offline: 0,
            store_errors: 0,
            held_elsewhere: false,
        }
    }

    /// Records are still waiting on a retry the engine should schedule.
    pub fn needs_retry(&self) -> bool {
        self.failed > 0
            || self.skipped_offline > 0
            || self.store_errors > 0
            || self.held_elsewhere
    }

    /// Folds a follow-up cycle into this report. Retry-related counters take
    /// the follow-up's values since they describe the queue as it is now.
    pub fn absorb(&mut self, later: CycleReport) {
        self.cycles += later.cycles;
        self.attempted += later.attempted;
        self.synced += later.synced;
        self.rejected += later.rejected;
        self.failed = later.failed;
        self.skipped_offline = later.skipped_offline;
        self.store_errors = later.store_errors;
        self.held_elsewhere = later.held_elsewhere;
    }
}

/// Non-blocking notifications for the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Queued { local_id: LocalId, worker_id: String },
    CycleStarted { trigger: TriggerReason, pending: usize },
    Synced { local_id: LocalId, worker_id: String },
    Failed { local_id: LocalId, worker_id: String, error: String },
    /// Retry budget exhausted; needs manual resolution.
    Rejected { local_id: LocalId, worker_id: String, error: String },
    CycleFinished(CycleReport),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Dropped silently when nobody is listening.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_keeps_latest_retry_state() {
        let mut first = CycleReport::new(TriggerReason::Manual);
        first.attempted = 2;
        first.synced = 1;
        first.failed = 1;

        let mut follow_up = CycleReport::new(TriggerReason::Coalesced);
        follow_up.attempted = 1;
        follow_up.synced = 1;

        first.absorb(follow_up);
        assert_eq!(first.cycles, 2);
        assert_eq!(first.attempted, 3);
        assert_eq!(first.synced, 2);
        assert!(!first.needs_retry());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::CycleStarted {
            trigger: TriggerReason::Startup,
            pending: 0,
        });

        let mut rx = bus.subscribe();
        let event = SyncEvent::Queued {
            local_id: LocalId(1),
            worker_id: "W1".to_string(),
        };
        bus.emit(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
