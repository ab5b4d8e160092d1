//! Reachability of the remote authority, published on a watch channel.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

/// Any HTTP answer counts as online; only transport failures are offline.
pub async fn ping(client: &reqwest::Client, url: &str) -> Connectivity {
    match client.get(url).send().await {
        Ok(_) => Connectivity::Online,
        Err(e) => {
            tracing::trace!(error = %e, "connectivity check failed");
            Connectivity::Offline
        }
    }
}

/// Periodically pings a URL. Starts out `Offline`.
pub struct ConnectivityMonitor {
    state: watch::Receiver<Connectivity>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectivityMonitor {
    pub fn start(client: reqwest::Client, url: String, interval: Duration) -> Self {
        let (tx, state) = watch::channel(Connectivity::Offline);
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = stop.notified() => break,

                    _ = ticker.tick() => {
                        let now = ping(&client, &url).await;
                        tx.send_if_modified(|current| {
                            if *current == now {
                                return false;
                            }
                            tracing::info!(from = ?*current, to = ?now, "connectivity changed");
                            *current = now;
                            true
                        });
                    }
                }
            }
        });

        tracing::info!(interval_secs = interval.as_secs(), "connectivity monitor started");
        Self {
            state,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.clone()
    }

    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("connectivity monitor did not stop in time");
            }
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
