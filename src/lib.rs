pub mod capture;
pub mod error;
pub mod motion;
pub mod recorder;
pub mod session;
pub mod storage;
pub mod stream;
pub mod supervisor;
pub mod utils;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource};
pub use error::{ConfigError, ControlError, RecordError, SourceError};
pub use session::{CameraSession, CameraStatus, SessionState};
pub use storage::RecordingEntry;
pub use supervisor::MonitorSupervisor;

/// Longest clip accepted by [`Settings::validate`]. AVI files are limited to
/// 4 GiB, which a long high-resolution MJPEG clip would exceed.
pub const MAX_CLIP_SECONDS: u64 = 900;

/// Environment variable prefix for configuration overrides
/// (`ARGUS__RECORDING__CLIP_SECONDS=5`).
pub const ENV_PREFIX: &str = "ARGUS";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub cameras: Vec<CameraConfig>,
    pub capture: CaptureConfig,
    pub motion: MotionConfig,
    pub recording: RecordingConfig,
    pub stream: StreamConfig,
}

/// One configured camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    /// Stable identifier, also the directory name under the recordings root
    pub id: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub device: DeviceSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
    /// Start motion clips on this camera; can be switched at runtime
    #[serde(default = "default_enabled")]
    pub motion_detection: bool,
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, kind: SourceKind, device: DeviceSpec) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            device,
            enabled: true,
            motion_detection: true,
        }
    }

    /// Label shown to clients, falling back to the id.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    #[default]
    V4l2,
    /// Synthetic moving-square feed, no hardware required
    TestPattern,
}

/// How a camera device is located
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    /// `/dev/video<N>`
    Index(u32),
    /// First capture device whose card name contains this text
    Card { card: String },
    /// Explicit device node
    Path(PathBuf),
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::Index(0)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Index(index) => write!(f, "/dev/video{index}"),
            DeviceSpec::Card { card } => write!(f, "card \"{card}\""),
            DeviceSpec::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Device indices tried, once each, when the configured device fails to open
    pub fallback_devices: Vec<u32>,
    /// A device that delivers nothing for this long is treated as unavailable
    pub frame_timeout_ms: u64,
    /// Consecutive capture errors tolerated before giving up on the device
    pub max_capture_errors: u32,
    /// Frames buffered between the capture and pump threads
    pub channel_capacity: usize,
    /// Pin each pump thread to its own core
    pub pin_threads: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            fallback_devices: vec![0, 1, 2, 3],
            frame_timeout_ms: 5_000,
            max_capture_errors: 10,
            channel_capacity: 8,
            pin_threads: false,
        }
    }
}

impl CaptureConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Nominal spacing between frames at the configured rate.
    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionConfig {
    /// Per-pixel intensity change that counts as "changed"
    pub sensitivity: u8,
    /// Smallest changed region, in pixels, reported as motion
    pub min_area: u32,
    /// Gaussian blur applied before differencing; 0 disables it
    pub blur_sigma: f32,
    /// 5x5 dilation passes applied to the thresholded map
    pub dilate_iterations: u8,
    /// Quiet time after which an open motion event is closed
    pub debounce_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sensitivity: 25,
            min_area: 5_000,
            blur_sigma: 3.5,
            dilate_iterations: 2,
            debounce_ms: 2_000,
        }
    }
}

impl MotionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingConfig {
    pub root: PathBuf,
    pub clip_seconds: u64,
    pub jpeg_quality: u8,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("recordings"),
            clip_seconds: 10,
            jpeg_quality: 80,
        }
    }
}

impl RecordingConfig {
    pub fn clip_duration(&self) -> Duration {
        Duration::from_secs(self.clip_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub jpeg_quality: u8,
    /// Frames queued per live subscriber before frames are dropped for it
    pub subscriber_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            subscriber_capacity: 4,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus `ARGUS__*` environment
    /// overrides, then validate them.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject malformed settings before any session starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !is_valid_camera_id(&camera.id) {
                return invalid(format!(
                    "camera id '{}' must be non-empty and use only A-Z, a-z, 0-9, '-' or '_'",
                    camera.id
                ));
            }
            if !seen.insert(camera.id.as_str()) {
                return invalid(format!("camera id '{}' is configured more than once", camera.id));
            }
            if let DeviceSpec::Card { card } = &camera.device {
                if card.trim().is_empty() {
                    return invalid(format!("camera '{}' has an empty card name", camera.id));
                }
            }
        }

        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return invalid("capture width and height must be positive".into());
        }
        if capture.fps == 0 {
            return invalid("capture fps must be positive".into());
        }
        if capture.buffer_count == 0 || capture.channel_capacity == 0 {
            return invalid("capture buffer_count and channel_capacity must be positive".into());
        }
        if capture.frame_timeout_ms == 0 {
            return invalid("capture frame_timeout_ms must be positive".into());
        }
        let uses_v4l2 = self
            .cameras
            .iter()
            .any(|c| c.enabled && c.kind == SourceKind::V4l2);
        if uses_v4l2 && !matches!(capture.format, PixelFormat::Mjpeg | PixelFormat::Yuyv4) {
            return invalid(format!(
                "capture format {:?} is not supported by V4L2 cameras (use mjpeg or yuyv4)",
                capture.format
            ));
        }

        let motion = &self.motion;
        if motion.sensitivity == 0 {
            return invalid("motion sensitivity must be between 1 and 255".into());
        }
        if motion.min_area == 0 {
            return invalid("motion min_area must be positive".into());
        }
        if !motion.blur_sigma.is_finite() || motion.blur_sigma < 0.0 {
            return invalid("motion blur_sigma must be a non-negative number".into());
        }

        if !(1..=MAX_CLIP_SECONDS).contains(&self.recording.clip_seconds) {
            return invalid(format!(
                "recording clip_seconds must be between 1 and {MAX_CLIP_SECONDS}"
            ));
        }
        for (name, quality) in [
            ("recording", self.recording.jpeg_quality),
            ("stream", self.stream.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return invalid(format!("{name} jpeg_quality must be between 1 and 100"));
            }
        }
        if self.stream.subscriber_capacity == 0 {
            return invalid("stream subscriber_capacity must be positive".into());
        }

        Ok(())
    }
}

/// Camera ids become directory names, so keep them to a safe alphabet.
pub fn is_valid_camera_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn camera(id: &str) -> CameraConfig {
        CameraConfig::new(id, SourceKind::TestPattern, DeviceSpec::Index(0))
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.recording.clip_duration(), Duration::from_secs(10));
        assert_eq!(settings.capture.fallback_devices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_frame_period() {
        let capture = CaptureConfig {
            fps: 10,
            ..CaptureConfig::default()
        };
        assert_eq!(capture.frame_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_duplicate_camera_rejected() {
        let settings = Settings {
            cameras: vec![camera("cam1"), camera("cam1")],
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unsafe_camera_id_rejected() {
        for id in ["", "../etc", "cam 1", "cam/1"] {
            let settings = Settings {
                cameras: vec![camera(id)],
                ..Settings::default()
            };
            assert!(settings.validate().is_err(), "id {id:?} should be rejected");
        }
    }

    #[test]
    fn test_clip_length_is_bounded() {
        let mut settings = Settings::default();
        settings.recording.clip_seconds = MAX_CLIP_SECONDS;
        assert!(settings.validate().is_ok());
        settings.recording.clip_seconds = 3_600;
        assert!(settings.validate().is_err());
        settings.recording.clip_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_raw_format_rejected_for_v4l2() {
        let settings = Settings {
            cameras: vec![CameraConfig::new(
                "cam1",
                SourceKind::V4l2,
                DeviceSpec::Index(2),
            )],
            capture: CaptureConfig {
                format: PixelFormat::Nv12,
                ..CaptureConfig::default()
            },
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[[cameras]]
id = "cam1"
device = 2
label = "Brio 100"

[[cameras]]
id = "cam2"
device = {{ card = "C170" }}

[[cameras]]
id = "cam3"
device = "/dev/video7"
enabled = false
motion_detection = false

[recording]
clip_seconds = 5
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.cameras.len(), 3);
        assert_eq!(settings.cameras[0].device, DeviceSpec::Index(2));
        assert_eq!(settings.cameras[0].display_label(), "Brio 100");
        assert_eq!(
            settings.cameras[1].device,
            DeviceSpec::Card {
                card: "C170".into()
            }
        );
        assert_eq!(
            settings.cameras[2].device,
            DeviceSpec::Path(PathBuf::from("/dev/video7"))
        );
        assert!(!settings.cameras[2].enabled);
        assert!(!settings.cameras[2].motion_detection);
        assert!(settings.cameras[0].motion_detection);
        assert_eq!(settings.recording.clip_seconds, 5);
        assert_eq!(settings.motion.sensitivity, 25);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[motion]\nsensitivty = 10").unwrap();
        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(ConfigError::Load(_))
        ));
    }
}
