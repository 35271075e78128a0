use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::connectivity::ConnectivityMonitor;

/// Platform primitive answering "can we reach the server right now".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Considers the link up when the server answers at all, whatever the status.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build connectivity probe client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %self.url, error = %e, "connectivity probe failed");
                false
            }
        }
    }
}

/// Polls `probe` every `every` and feeds the results to `monitor` until
/// `shutdown` flips to true.
pub fn spawn_probe_loop(
    probe: Arc<dyn ConnectivityProbe>,
    monitor: ConnectivityMonitor,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reachable = probe.is_reachable().await;
                    monitor.report(reachable);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
