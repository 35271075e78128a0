use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

pub mod probe;

pub use probe::{spawn_probe_loop, ConnectivityProbe, HttpProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEdge {
    WentOnline,
    WentOffline,
}

impl ConnectivityEdge {
    fn from_state(online: bool) -> Self {
        if online {
            ConnectivityEdge::WentOnline
        } else {
            ConnectivityEdge::WentOffline
        }
    }
}

type Listener = Arc<dyn Fn(ConnectivityEdge) + Send + Sync>;

/// Single source of truth for "are we online".
///
/// Raw platform signals go in through [`report`](Self::report). A signal only
/// becomes an edge after the link has stayed in the new state for the whole
/// debounce window, so flapping collapses into at most one edge.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: watch::Receiver<bool>,
    raw: mpsc::UnboundedSender<bool>,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl ConnectivityMonitor {
    /// `initial` comes from the platform check done at startup; no edge is
    /// fired for it. Must be called inside a Tokio runtime.
    pub fn new(initial: bool, debounce: Duration) -> Self {
        let (state_tx, state_rx) = watch::channel(initial);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(debounce_loop(raw_rx, state_tx, listeners.clone(), debounce));

        Self {
            state: state_rx,
            raw: raw_tx,
            listeners,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Feeds a raw status signal from the platform. Repeats are fine.
    pub fn report(&self, online: bool) {
        if self.raw.send(online).is_err() {
            warn!("connectivity monitor stopped; dropping status report");
        }
    }

    /// Registers a callback invoked once per debounced edge.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(ConnectivityEdge) + Send + Sync + 'static,
    {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(listener)),
        }
    }

    /// Async view of the debounced state; `changed()` resolves on each edge.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }
}

async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<bool>,
    state: watch::Sender<bool>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    debounce: Duration,
) {
    while let Some(mut latest) = raw.recv().await {
        // Trailing debounce: every new signal restarts the quiet period.
        let mut closed = false;
        loop {
            match timeout(debounce, raw.recv()).await {
                Ok(Some(next)) => latest = next,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let changed = state.send_if_modified(|current| {
            if *current == latest {
                false
            } else {
                *current = latest;
                true
            }
        });

        if changed {
            let edge = ConnectivityEdge::from_state(latest);
            info!(?edge, "connectivity changed");
            let snapshot: Vec<Listener> = match listeners.lock() {
                Ok(listeners) => listeners.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            for listener in snapshot {
                listener(edge);
            }
        }

        if closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn recorded_edges(monitor: &ConnectivityMonitor) -> Arc<Mutex<Vec<ConnectivityEdge>>> {
        let edges = Arc::new(Mutex::new(Vec::new()));
        let sink = edges.clone();
        monitor.on_change(move |edge| sink.lock().unwrap().push(edge));
        edges
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_within_window_yields_single_edge() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_millis(1500));
        let edges = recorded_edges(&monitor);

        monitor.report(true);
        sleep(Duration::from_millis(200)).await;
        monitor.report(false);
        sleep(Duration::from_millis(200)).await;
        monitor.report(true);
        sleep(Duration::from_secs(3)).await;

        assert_eq!(*edges.lock().unwrap(), vec![ConnectivityEdge::WentOnline]);
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_back_to_initial_state_yields_no_edge() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_millis(1500));
        let edges = recorded_edges(&monitor);

        monitor.report(false);
        sleep(Duration::from_millis(150)).await;
        monitor.report(true);
        sleep(Duration::from_millis(150)).await;
        monitor.report(false);
        sleep(Duration::from_millis(150)).await;
        monitor.report(true);
        sleep(Duration::from_secs(3)).await;

        assert!(edges.lock().unwrap().is_empty());
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn each_settled_transition_fires_once() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(1));
        let edges = recorded_edges(&monitor);

        monitor.report(false);
        monitor.report(false);
        sleep(Duration::from_secs(2)).await;
        assert!(!monitor.is_online());

        monitor.report(true);
        sleep(Duration::from_secs(2)).await;

        // Repeated status signals are not edges.
        monitor.report(true);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(
            *edges.lock().unwrap(),
            vec![ConnectivityEdge::WentOffline, ConnectivityEdge::WentOnline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn initial_state_is_not_an_edge() {
        let monitor = ConnectivityMonitor::new(true, Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_secs(5)).await;
        assert!(monitor.is_online());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_observe_edges() {
        let monitor = ConnectivityMonitor::new(false, Duration::from_millis(500));
        let mut rx = monitor.subscribe();

        monitor.report(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
