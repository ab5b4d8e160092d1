//! Offline-first replication of the candidate store to a remote authority.
//!
//! The whole collection goes up as one JSON array; the remote upserts by
//! email, so repeating a batch is harmless. A trigger that arrives while a
//! push is in flight is coalesced rather than queued.

use crate::connectivity::Connectivity;
use chrono::{DateTime, Utc};
use examgate_core::CandidateRecord;
use examgate_store::{CandidateStore, StoreError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote rejected the batch: {0}")]
    Remote(String),
    #[error("failed to read local store: {0}")]
    Store(#[from] StoreError),
}

/// Where batches are delivered.
pub trait RemoteSink: Send + Sync + 'static {
    fn push(
        &self,
        batch: &[CandidateRecord],
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

/// POSTs the batch as a JSON array.
pub struct HttpRemote {
    client: reqwest::Client,
    url: String,
}

impl HttpRemote {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

impl RemoteSink for HttpRemote {
    async fn push(&self, batch: &[CandidateRecord]) -> Result<(), SyncError> {
        self.client
            .post(&self.url)
            .json(batch)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SyncError::Remote(e.to_string()))?;
        Ok(())
    }
}

/// `Idle` until the first attempt; afterwards the outcome of the latest
/// attempt stays published until the next trigger moves it to `Syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    /// Outcome of the most recent finished attempt, kept while the next
    /// one is `Syncing`.
    pub last_outcome: Option<SyncState>,
    /// Set after a failure until a later attempt succeeds.
    pub pending_retry: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_batch: usize,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_outcome: None,
            pending_retry: false,
            last_attempt: None,
            last_batch: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TriggerOutcome {
    /// The batch of `records` was accepted by the remote.
    Synced { records: usize },
    /// A sync was already running; this trigger was absorbed into it.
    Coalesced,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator<S: CandidateStore, R: RemoteSink> {
    store: Arc<S>,
    remote: R,
    in_flight: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl<S: CandidateStore, R: RemoteSink> SyncCoordinator<S, R> {
    pub fn new(store: Arc<S>, remote: R) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            store,
            remote,
            in_flight: AtomicBool::new(false),
            status,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Push the full store once, unless a push is already running.
    pub async fn sync_now(&self) -> Result<TriggerOutcome, SyncError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("sync already in flight, trigger coalesced");
            return Ok(TriggerOutcome::Coalesced);
        }
        let _guard = InFlight(&self.in_flight);

        self.status.send_modify(|s| {
            s.state = SyncState::Syncing;
            s.last_attempt = Some(Utc::now());
        });

        let result = self.push_all().await;

        self.status.send_modify(|s| {
            let outcome = match &result {
                Ok(records) => {
                    s.pending_retry = false;
                    s.last_batch = *records;
                    s.last_error = None;
                    SyncState::Succeeded
                }
                Err(e) => {
                    s.pending_retry = true;
                    s.last_error = Some(e.to_string());
                    SyncState::Failed
                }
            };
            s.state = outcome;
            s.last_outcome = Some(outcome);
        });

        match result {
            Ok(records) => {
                tracing::info!(records, "candidates synced");
                Ok(TriggerOutcome::Synced { records })
            }
            Err(e) => {
                tracing::warn!(error = %e, "sync failed, will retry when back online");
                Err(e)
            }
        }
    }

    async fn push_all(&self) -> Result<usize, SyncError> {
        let batch = self.store.get_all().await?;
        self.status.send_modify(|s| s.last_batch = batch.len());
        self.remote.push(&batch).await?;
        Ok(batch.len())
    }
}

/// Runs a sync every time connectivity goes from offline to online.
pub struct SyncScheduler {
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn start<S: CandidateStore, R: RemoteSink>(
        coordinator: Arc<SyncCoordinator<S, R>>,
        mut connectivity: watch::Receiver<Connectivity>,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);
        // Read before spawning so a change made right after `start` is
        // still seen as a transition.
        let mut online = *connectivity.borrow_and_update() == Connectivity::Online;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = stop.notified() => break,

                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            tracing::debug!("connectivity source closed");
                            break;
                        }
                        let now_online = *connectivity.borrow_and_update() == Connectivity::Online;
                        if now_online && !online {
                            tracing::info!("back online, syncing");
                            // Failures are recorded in the coordinator status.
                            let _ = coordinator.sync_now().await;
                        }
                        online = now_online;
                    }
                }
            }
        });

        tracing::info!("sync scheduler started");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(_) => tracing::info!("sync scheduler stopped"),
                Err(_) => tracing::warn!("sync scheduler did not stop in time"),
            }
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
