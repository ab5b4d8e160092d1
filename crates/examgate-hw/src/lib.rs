//! examgate-hw — Camera access as a scoped frame source.
//!
//! A camera is acquired through a [`CameraOpener`] and released when the
//! returned [`FrameSource`] is dropped. The V4L2 backend serves live
//! capture; [`StillCamera`] replays fixed frames for uploads and tests.

pub mod camera;
pub mod convert;
pub mod source;

pub use camera::{Camera, CameraError, PixelFormat, V4lOpener};
pub use source::{CameraOpener, FrameSource, StillCamera, StillFrames};
