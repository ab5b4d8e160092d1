//! Frame source traits and the in-memory still-image camera.

use crate::camera::CameraError;
use examgate_core::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An acquired camera. Dropping it releases the device.
pub trait FrameSource: Send + 'static {
    /// Block until the next usable frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Acquires a [`FrameSource`] on demand.
pub trait CameraOpener: Send + Sync + 'static {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, CameraError>;
}

/// Replays a fixed list of frames; the last one repeats.
pub struct StillFrames {
    frames: Vec<Frame>,
    cursor: usize,
    released: Option<Arc<AtomicUsize>>,
}

impl StillFrames {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            cursor: 0,
            released: None,
        }
    }

    /// A source for one uploaded still image.
    pub fn single(frame: Frame) -> Self {
        Self::new(vec![frame])
    }
}

impl FrameSource for StillFrames {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let frame = self
            .frames
            .get(self.cursor)
            .or_else(|| self.frames.last())
            .cloned()
            .ok_or_else(|| CameraError::CaptureFailed("no frames to replay".into()))?;
        if self.cursor < self.frames.len() {
            self.cursor += 1;
        }
        Ok(frame)
    }
}

impl Drop for StillFrames {
    fn drop(&mut self) {
        if let Some(released) = &self.released {
            released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Opener that hands out [`StillFrames`] and counts acquisitions and
/// releases, so callers can check that the camera is always given back.
#[derive(Clone)]
pub struct StillCamera {
    frames: Vec<Frame>,
    available: bool,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl StillCamera {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            available: true,
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A camera that is always busy.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of sources currently held.
    pub fn in_use(&self) -> usize {
        self.open_count() - self.release_count()
    }
}

impl CameraOpener for StillCamera {
    type Source = StillFrames;

    fn open(&self) -> Result<StillFrames, CameraError> {
        if !self.available {
            return Err(CameraError::DeviceBusy);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(StillFrames {
            frames: self.frames.clone(),
            cursor: 0,
            released: Some(Arc::clone(&self.released)),
        })
    }
}
