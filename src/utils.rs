use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::DeviceSpec;

/// Highest `/dev/videoN` probed when enumerating devices
const MAX_PROBED_INDEX: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: PathBuf,
    pub card: String,
    pub formats: Vec<PixelFormat>,
}

/// Device node for an index.
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{}", index))
}

/// List capture-capable devices with the formats we can consume.
pub fn enumerate_devices() -> Vec<FoundDevice> {
    (0..MAX_PROBED_INDEX)
        .map(device_path)
        .filter(|path| path.exists())
        .filter_map(|path| probe(&path))
        .collect()
}

fn probe(path: &Path) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        debug!("{} has no capture capability", path.display());
        return None;
    }

    let formats = dev
        .enum_formats()
        .map(|formats| {
            formats
                .iter()
                .filter_map(|fmt| {
                    if fmt.fourcc == FourCC::new(b"MJPG") {
                        Some(PixelFormat::Mjpeg)
                    } else if fmt.fourcc == FourCC::new(b"YUYV") {
                        Some(PixelFormat::Yuyv4)
                    } else {
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Some(FoundDevice {
        path: path.to_path_buf(),
        card: caps.card,
        formats,
    })
}

/// First capture device whose card name contains `needle` (case-insensitive).
pub fn find_device_by_card(needle: &str) -> Result<FoundDevice> {
    let needle = needle.to_lowercase();
    enumerate_devices()
        .into_iter()
        .find(|dev| dev.card.to_lowercase().contains(&needle))
        .map(|dev| {
            info!("Matched card {:?} at {}", dev.card, dev.path.display());
            dev
        })
        .ok_or_else(|| eyre!("no capture device with card name matching {:?}", needle))
}

/// Resolve a configured device to a node path.
pub fn resolve_device(spec: &DeviceSpec) -> Result<PathBuf> {
    match spec {
        DeviceSpec::Index(index) => Ok(device_path(*index)),
        DeviceSpec::Path(path) => Ok(path.clone()),
        DeviceSpec::Card { card } => find_device_by_card(card).map(|dev| dev.path),
    }
}
