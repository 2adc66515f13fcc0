//! V4L2 capture through memory-mapped buffers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::FrameSource;
use crate::error::SourceError;
use crate::CaptureConfig;

/// One opened V4L2 camera
pub struct V4l2Capture {
    _device: Box<Device>,
    stream: MmapStream<'static>,
    camera_id: Arc<str>,
    path: PathBuf,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Capture {
    /// Open a device node, negotiate format and rate, and start streaming.
    #[instrument(skip(config))]
    pub fn open(camera_id: Arc<str>, path: &Path, config: &CaptureConfig) -> Result<Self> {
        let device = Device::with_path(path)?;

        // Query capabilities
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(eyre!("Device doesn't support video capture"));
        }

        // Set format
        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => return Err(eyre!("Unsupported pixel format {:?}", other)),
        };

        let fmt = device.set_format(&fmt)?;
        let format = if fmt.fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else {
            return Err(eyre!("Device negotiated unsupported fourcc {}", fmt.fourcc));
        };
        if (fmt.width, fmt.height) != (config.width, config.height) {
            warn!(
                "Requested {}x{}, device delivers {}x{}",
                config.width, config.height, fmt.width, fmt.height
            );
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Failed to set {} fps: {}", config.fps, e);
        }

        let device = Box::new(device);
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
        info!(
            "Capture stream started on {} with {} buffers",
            path.display(),
            config.buffer_count
        );

        Ok(Self {
            _device: device,
            stream,
            camera_id,
            path: path.to_path_buf(),
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
            sequence: 0,
        })
    }
}

impl FrameSource for V4l2Capture {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let timestamp = Instant::now();

        // Blocks until the driver hands back a filled buffer
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| SourceError::Capture(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(SourceError::Capture("driver returned an empty buffer".into()));
        }
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        let frame_meta = Arc::new(FrameMetadata {
            camera_id: self.camera_id.clone(),
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        });

        Ok(Frame {
            data,
            meta: frame_meta,
            timestamp,
            captured_at: Local::now(),
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
