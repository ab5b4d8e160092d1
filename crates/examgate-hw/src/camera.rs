//! V4L2 camera capture via the `v4l` crate.

use crate::convert::{self, ConvertError};
use crate::source::{CameraOpener, FrameSource};
use examgate_core::{Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Dark frames tolerated in a row before a grab gives up.
const MAX_DARK_FRAMES: usize = 5;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Convert(#[from] ConvertError),
    #[error("frame decode failed: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, Y channel extracted.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// Motion-JPEG, decoded per frame.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else {
            None
        }
    }
}

/// An open V4L2 capture device. The device is released on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a capture device and negotiate the requested resolution.
    ///
    /// Asks for YUYV; GREY and MJPG are accepted if the driver substitutes
    /// them. The driver may also pick a different resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY or MJPG)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera acquired"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Capture one non-dark grayscale frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        for _ in 0..MAX_DARK_FRAMES {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

            let mut frame = self.to_frame(buf)?;
            frame.sequence = meta.sequence;

            if !frame.is_dark() {
                return Ok(frame);
            }
            tracing::debug!(seq = meta.sequence, "skipping dark frame");
        }

        Err(CameraError::CaptureFailed(format!(
            "{MAX_DARK_FRAMES} consecutive dark frames"
        )))
    }

    fn to_frame(&self, buf: &[u8]) -> Result<Frame, CameraError> {
        let frame = match self.pixel_format {
            PixelFormat::Yuyv => Frame::new(
                convert::yuyv_to_grayscale(buf, self.width, self.height)?,
                self.width,
                self.height,
            )?,
            PixelFormat::Grey => Frame::new(
                convert::grey_passthrough(buf, self.width, self.height)?,
                self.width,
                self.height,
            )?,
            PixelFormat::Mjpeg => Frame::decode(buf)?,
        };
        Ok(frame)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}

/// Opens the configured V4L2 device on demand.
#[derive(Debug, Clone)]
pub struct V4lOpener {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    /// Frames discarded after opening while auto-exposure settles.
    pub warmup_frames: usize,
}

impl CameraOpener for V4lOpener {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        let camera = Camera::open(&self.device_path, self.width, self.height)?;
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for _ in 0..self.warmup_frames {
                let _ = camera.capture_frame();
            }
        }
        Ok(camera)
    }
}
