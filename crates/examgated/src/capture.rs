//! Capture sessions: scoped camera ownership plus the live sampling loop.
//!
//! A session opens the camera when it starts and gives it back on
//! `stop()`, on drop, and when opening fails half way. While it runs, a
//! fixed-interval task grabs a frame, asks the provider for a face and
//! publishes whether one is in view.

use examgate_core::{Detection, EmbeddingProvider, Frame, ProviderError};
use examgate_hw::{CameraError, CameraOpener, FrameSource};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("capture session already released")]
    Released,
    #[error("capture task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

type SharedSource<S> = Arc<Mutex<Option<S>>>;

/// A running capture session owning one camera.
pub struct CaptureSession<S: FrameSource, P: EmbeddingProvider> {
    source: SharedSource<S>,
    provider: Arc<P>,
    face_present: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl<S: FrameSource, P: EmbeddingProvider> CaptureSession<S, P> {
    /// Acquire the camera and start sampling every `interval`.
    ///
    /// Refuses to touch the camera when the provider's models are not
    /// loaded.
    pub async fn start<C>(
        opener: Arc<C>,
        provider: Arc<P>,
        interval: Duration,
    ) -> Result<Self, CaptureError>
    where
        C: CameraOpener<Source = S>,
    {
        if !provider.models_loaded() {
            return Err(ProviderError::ModelsNotLoaded.into());
        }

        let source = tokio::task::spawn_blocking(move || opener.open()).await??;
        let source: SharedSource<S> = Arc::new(Mutex::new(Some(source)));

        let (tx, face_present) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn(sampling_loop(
            Arc::clone(&source),
            Arc::clone(&provider),
            tx,
            Arc::clone(&shutdown),
            interval,
        ));

        tracing::info!(interval_ms = interval.as_millis() as u64, "capture session started");

        Ok(Self {
            source,
            provider,
            face_present,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Whether the sampling loop saw a face on its last tick.
    pub fn face_present(&self) -> bool {
        *self.face_present.borrow()
    }

    /// Grab a fresh frame and run detection on it.
    pub async fn capture(&self) -> Result<Option<Detection>, CaptureError> {
        let frame = grab(&self.source).await?;
        Ok(self.provider.detect(&frame).await?)
    }

    /// Try up to `attempts` frames and return the first detected face.
    pub async fn capture_face(&self, attempts: usize) -> Result<Option<Detection>, CaptureError> {
        for attempt in 1..=attempts.max(1) {
            if let Some(detection) = self.capture().await? {
                tracing::debug!(attempt, "face captured");
                return Ok(Some(detection));
            }
        }
        Ok(None)
    }

    /// Stop the sampling loop and release the camera.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "sampling loop panicked"),
                Err(_) => tracing::warn!("sampling loop did not stop in time"),
            }
        }

        release(&self.source);
        tracing::info!("capture session stopped");
    }
}

impl<S: FrameSource, P: EmbeddingProvider> Drop for CaptureSession<S, P> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        release(&self.source);
    }
}

fn release<S>(source: &SharedSource<S>) {
    let taken = match source.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    drop(taken);
}

/// Read one frame on the blocking pool.
async fn grab<S: FrameSource>(source: &SharedSource<S>) -> Result<Frame, CaptureError> {
    let source = Arc::clone(source);
    tokio::task::spawn_blocking(move || {
        let mut guard = source.lock().map_err(|_| CaptureError::Released)?;
        let camera = guard.as_mut().ok_or(CaptureError::Released)?;
        Ok(camera.next_frame()?)
    })
    .await?
}

async fn sampling_loop<S: FrameSource, P: EmbeddingProvider>(
    source: SharedSource<S>,
    provider: Arc<P>,
    face_present: watch::Sender<bool>,
    shutdown: Arc<Notify>,
    interval: Duration,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            _ = ticker.tick() => {
                let frame = match grab(&source).await {
                    Ok(frame) => frame,
                    Err(CaptureError::Released) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "sampling: frame grab failed");
                        continue;
                    }
                };
                match provider.detect(&frame).await {
                    Ok(detection) => {
                        let present = detection.is_some();
                        face_present.send_if_modified(|current| {
                            let changed = *current != present;
                            *current = present;
                            changed
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "sampling: detection failed"),
                }
            }
        }
    }

    tracing::debug!("sampling loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use examgate_core::{Descriptor, ScriptedProvider, DESCRIPTOR_DIM};
    use examgate_hw::StillCamera;

    fn frame() -> Frame {
        Frame::new(vec![128; 16], 4, 4).unwrap()
    }

    fn descriptor(value: f32) -> Descriptor {
        Descriptor::new([value; DESCRIPTOR_DIM]).unwrap()
    }

    async fn loaded(script: Vec<Option<Descriptor>>) -> Arc<ScriptedProvider> {
        let provider = Arc::new(ScriptedProvider::new(script));
        provider.load_models().await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_capture_returns_detection() {
        let camera = Arc::new(StillCamera::new(vec![frame()]));
        let provider = loaded(vec![Some(descriptor(0.3))]).await;
        let session = CaptureSession::start(Arc::clone(&camera), provider, Duration::from_secs(3600))
            .await
            .unwrap();

        let face = session.capture_face(3).await.unwrap().unwrap();
        assert_eq!(face.descriptor, descriptor(0.3));
        assert_eq!(camera.in_use(), 1);

        session.stop().await;
        assert_eq!(camera.in_use(), 0);
    }

    #[tokio::test]
    async fn test_capture_no_face() {
        let camera = Arc::new(StillCamera::new(vec![frame()]));
        let provider = loaded(Vec::new()).await;
        let session = CaptureSession::start(Arc::clone(&camera), provider, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(session.capture_face(2).await.unwrap().is_none());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_drop_releases_camera() {
        let camera = Arc::new(StillCamera::new(vec![frame()]));
        let provider = loaded(Vec::new()).await;
        let session = CaptureSession::start(Arc::clone(&camera), provider, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(camera.in_use(), 1);
        drop(session);
        assert_eq!(camera.in_use(), 0);
    }

    #[tokio::test]
    async fn test_models_not_loaded_never_opens_camera() {
        let camera = Arc::new(StillCamera::new(vec![frame()]));
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let err = CaptureSession::start(Arc::clone(&camera), provider, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Provider(ProviderError::ModelsNotLoaded)));
        assert_eq!(camera.open_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_camera() {
        let camera = Arc::new(StillCamera::unavailable());
        let provider = loaded(Vec::new()).await;
        let err = CaptureSession::start(camera, provider, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Camera(CameraError::DeviceBusy)));
    }

    #[tokio::test]
    async fn test_sampling_publishes_face_presence() {
        let camera = Arc::new(StillCamera::new(vec![frame()]));
        let provider = loaded(vec![Some(descriptor(0.1)); 1000]).await;
        let session = CaptureSession::start(Arc::clone(&camera), provider, Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.face_present() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.stop().await;
        assert_eq!(camera.in_use(), 0);
    }
}
