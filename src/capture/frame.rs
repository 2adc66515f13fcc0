use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Monotonic capture timestamp, used for clip timing
    pub timestamp: Instant,

    /// Wall-clock capture time, used for clip names
    pub captured_at: DateTime<Local>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub camera_id: Arc<str>,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row for packed formats, luma row length for planar ones
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
    Gray8,
}

impl PixelFormat {
    /// Bytes per pixel in the first plane; `None` for compressed formats.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Nv12 | PixelFormat::Gray8 => Some(1),
            PixelFormat::Mjpeg => None,
        }
    }
}

impl Frame {
    /// Build a frame from an uncompressed or MJPEG buffer captured now.
    pub fn new(
        camera_id: Arc<str>,
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
    ) -> Self {
        let stride = format.bytes_per_pixel().map_or(0, |bpp| width * bpp);
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                camera_id,
                sequence,
                width,
                height,
                stride,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
            captured_at: Local::now(),
        }
    }

    /// Override the capture timestamps (replayed or synthetic feeds).
    pub fn with_timestamps(mut self, timestamp: Instant, captured_at: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self.captured_at = captured_at;
        self
    }

    pub fn camera_id(&self) -> &str {
        &self.meta.camera_id
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.meta.camera_id)
            .field("sequence", &self.meta.sequence)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}
