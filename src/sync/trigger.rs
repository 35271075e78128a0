use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::connectivity::ConnectivityMonitor;
use crate::sync::engine::{CycleOutcome, SyncEngine};
use crate::sync::events::TriggerReason;

/// Exponential delay between automatic retries: `base * 2^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Asks the running policy for a cycle. Cheap to clone.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<()>,
}

impl TriggerHandle {
    /// Returns false once the policy has stopped.
    pub async fn sync_now(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }

    /// For plain threads outside the runtime, such as a stdin reader.
    /// Panics if called from async code.
    pub fn sync_now_blocking(&self) -> bool {
        self.tx.blocking_send(()).is_ok()
    }
}

/// Decides when the engine runs: at startup when online, on every online
/// edge, on manual request, and after a backoff while work is left over.
/// With a queue poll it also notices records appended by other processes.
pub struct TriggerPolicy {
    engine: Arc<SyncEngine>,
    connectivity: watch::Receiver<bool>,
    manual: mpsc::Receiver<()>,
    backoff: RetryBackoff,
    queue_poll: Option<Duration>,
}

impl TriggerPolicy {
    pub fn new(
        engine: Arc<SyncEngine>,
        monitor: &ConnectivityMonitor,
        backoff: RetryBackoff,
    ) -> (Self, TriggerHandle) {
        let (tx, manual) = mpsc::channel(16);
        let policy = Self {
            engine,
            connectivity: monitor.subscribe(),
            manual,
            backoff,
            queue_poll: None,
        };
        (policy, TriggerHandle { tx })
    }

    pub fn with_queue_poll(mut self, every: Duration) -> Self {
        self.queue_poll = Some(every);
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut retry_at: Option<Instant> = None;
        let mut manual_open = true;
        let mut queue_poll = self.queue_poll.map(|every| {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        if *self.connectivity.borrow_and_update() {
            retry_at = self.fire(TriggerReason::Startup).await;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sync trigger policy stopping");
                        break;
                    }
                }
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *self.connectivity.borrow_and_update() {
                        self.backoff.reset();
                        retry_at = self.fire(TriggerReason::ConnectivityRestored).await;
                    } else {
                        // Nothing can succeed offline; the online edge restarts work.
                        retry_at = None;
                    }
                }
                request = self.manual.recv(), if manual_open => {
                    if request.is_none() {
                        // Every handle is gone; the other triggers still apply.
                        manual_open = false;
                        continue;
                    }
                    while self.manual.try_recv().is_ok() {}
                    retry_at = self.fire(TriggerReason::Manual).await;
                }
                _ = wait_until(retry_at) => {
                    retry_at = self.fire(TriggerReason::Retry).await;
                }
                _ = tick(&mut queue_poll) => {
                    // A scheduled retry will pick the new records up anyway.
                    if retry_at.is_none()
                        && *self.connectivity.borrow()
                        && self.has_pending_records().await
                    {
                        retry_at = self.fire(TriggerReason::QueueChanged).await;
                    }
                }
            }
        }
    }

    /// Runs a cycle and returns when the next automatic retry is due, if any.
    async fn fire(&mut self, trigger: TriggerReason) -> Option<Instant> {
        match self.engine.request_cycle(trigger).await {
            CycleOutcome::Completed(report) if report.needs_retry() => {
                if !*self.connectivity.borrow() {
                    return None;
                }
                let delay = self.backoff.next_delay();
                debug!(delay_secs = delay.as_secs(), "retry scheduled");
                Some(Instant::now() + delay)
            }
            CycleOutcome::Completed(_) => {
                self.backoff.reset();
                None
            }
            // The running cycle's owner reruns on our behalf.
            CycleOutcome::Coalesced => None,
        }
    }

    async fn has_pending_records(&self) -> bool {
        match self.engine.store().counts().await {
            Ok(counts) => counts.pending > 0,
            Err(e) => {
                error!(error = %e, "failed to inspect local queue");
                false
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
