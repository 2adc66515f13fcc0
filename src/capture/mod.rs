pub mod decoder;
pub mod frame;
pub mod pattern;
pub mod v4l2;

use std::sync::Arc;

use tracing::{info, warn};

pub use frame::Frame;
pub use frame::PixelFormat;
pub use pattern::TestPattern;
pub use v4l2::V4l2Capture;

use crate::error::SourceError;
use crate::{utils, CameraConfig, CaptureConfig, DeviceSpec, SourceKind};

/// A camera producing a continuous sequence of frames.
///
/// `next_frame` may block for as long as the device takes; callers that need
/// a bound on that wait run the source on its own thread.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Dropping the source has the same effect.
    fn close(&mut self) {}

    /// Human readable description of the opened device
    fn describe(&self) -> String;
}

/// Opens the frame source for a configured camera.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        camera: &CameraConfig,
        capture: &CaptureConfig,
    ) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Opener for real deployments: V4L2 devices with fallback, or the test pattern.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceOpener;

impl SourceOpener for DeviceOpener {
    fn open(
        &self,
        camera: &CameraConfig,
        capture: &CaptureConfig,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let camera_id: Arc<str> = Arc::from(camera.id.as_str());
        match camera.kind {
            SourceKind::TestPattern => Ok(Box::new(TestPattern::new(
                camera_id,
                capture.width,
                capture.height,
                capture.fps,
            ))),
            SourceKind::V4l2 => {
                let candidates = candidate_devices(&camera.device, &capture.fallback_devices);
                let source = open_with_fallback(&camera.id, &candidates, |spec| {
                    let path = utils::resolve_device(spec)?;
                    V4l2Capture::open(camera_id.clone(), &path, capture)
                })?;
                Ok(Box::new(source))
            }
        }
    }
}

/// The configured device followed by each fallback index not already covered.
pub fn candidate_devices(primary: &DeviceSpec, fallbacks: &[u32]) -> Vec<DeviceSpec> {
    let mut candidates = vec![primary.clone()];
    for &index in fallbacks {
        let spec = DeviceSpec::Index(index);
        let duplicate = candidates.iter().any(|c| match c {
            DeviceSpec::Index(i) => *i == index,
            DeviceSpec::Path(p) => *p == utils::device_path(index),
            DeviceSpec::Card { .. } => false,
        });
        if !duplicate {
            candidates.push(spec);
        }
    }
    candidates
}

/// Try each candidate exactly once, in order; fail with `DeviceUnavailable`
/// naming every device tried when none opens.
pub fn open_with_fallback<S, F>(
    camera_id: &str,
    candidates: &[DeviceSpec],
    mut try_open: F,
) -> Result<S, SourceError>
where
    F: FnMut(&DeviceSpec) -> color_eyre::Result<S>,
{
    let mut failures = Vec::with_capacity(candidates.len());
    for (attempt, spec) in candidates.iter().enumerate() {
        match try_open(spec) {
            Ok(source) => {
                if attempt > 0 {
                    warn!(camera = camera_id, "Opened fallback device {}", spec);
                } else {
                    info!(camera = camera_id, "Opened device {}", spec);
                }
                return Ok(source);
            }
            Err(e) => {
                warn!(camera = camera_id, "Could not open {}: {}", spec, e);
                failures.push(format!("{spec}: {e}"));
            }
        }
    }

    Err(SourceError::DeviceUnavailable {
        camera: camera_id.to_string(),
        reason: if failures.is_empty() {
            "no candidate devices".to_string()
        } else {
            format!("tried {}", failures.join("; "))
        },
    })
}
