use anyhow::{Context, Result};
use examgate_core::{EmbeddingProvider, MatchEngine};
use examgate_hw::V4lOpener;
use examgate_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod connectivity;
mod dbus_interface;
mod embedder;
mod enrollment;
mod registry;
mod sync;
#[cfg(test)]
mod testutil;
mod verification;

use config::{BusType, Config};
use connectivity::ConnectivityMonitor;
use dbus_interface::{RegistryService, BUS_NAME, OBJECT_PATH};
use embedder::HttpEmbeddingProvider;
use registry::{CaptureSettings, IdleReaper, Registry};
use sync::{HttpRemote, SyncCoordinator, SyncScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("examgated starting");

    let config = Config::load().context("failed to load configuration")?;
    let engine = MatchEngine::new(config.match_threshold)?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
    );

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let provider = Arc::new(HttpEmbeddingProvider::new(client.clone(), &config.embedder_url));
    if let Err(e) = provider.load_models().await {
        // Keep serving storage, search and sync; capture reports ModelsUnavailable.
        tracing::warn!(error = %e, url = %config.embedder_url, "embedding models unavailable");
    }

    let opener = Arc::new(V4lOpener {
        device_path: config.camera_device.clone(),
        width: config.camera_width,
        height: config.camera_height,
        warmup_frames: config.warmup_frames,
    });

    let sync = Arc::new(SyncCoordinator::new(
        Arc::clone(&store),
        HttpRemote::new(client.clone(), &config.sync_url),
    ));

    let registry = Arc::new(Registry::new(
        Arc::clone(&store),
        provider,
        opener,
        Arc::clone(&sync),
        engine,
        CaptureSettings {
            sample_interval: config.sample_interval,
            frames_per_verify: config.frames_per_verify,
        },
    ));

    if let Some(path) = &config.admin_seed_file {
        registry.seed_admins(path).await?;
    }

    let reaper = IdleReaper::start(Arc::clone(&registry), config.enrollment_idle);

    let mut sync_events = sync.subscribe();
    tokio::spawn(async move {
        while sync_events.changed().await.is_ok() {
            let status = sync_events.borrow_and_update().clone();
            tracing::debug!(
                state = ?status.state,
                pending_retry = status.pending_retry,
                batch = status.last_batch,
                "sync state changed"
            );
        }
    });

    let monitor = ConnectivityMonitor::start(client, config.ping_url.clone(), config.ping_interval);
    let scheduler = SyncScheduler::start(Arc::clone(&sync), monitor.subscribe());

    let builder = match config.bus {
        BusType::System => zbus::connection::Builder::system()?,
        BusType::Session => zbus::connection::Builder::session()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RegistryService::new(Arc::clone(&registry)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "examgated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("examgated shutting down");

    scheduler.stop().await;
    monitor.stop().await;
    reaper.stop().await;
    registry.shutdown().await;
    drop(connection);
    drop(registry);
    drop(sync);

    match Arc::try_unwrap(store) {
        Ok(store) => store.close().await?,
        Err(_) => tracing::warn!("store still referenced at shutdown, skipping close"),
    }

    Ok(())
}
