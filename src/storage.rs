//! Recordings store layout: `<root>/<camera>/<trigger>/<trigger>_<YYYYMMDD>_<HHMMSS>.avi`
//!
//! Clips are written under a `.part` name and renamed once finalized, so
//! anything listed here is a complete file.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::is_valid_camera_id;

pub const CLIP_EXTENSION: &str = "avi";
pub const PARTIAL_EXTENSION: &str = "part";

/// Name collisions within one second are resolved with a numeric suffix
const MAX_NAME_SUFFIX: u32 = 1_000;

/// What started a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Motion,
    Manual,
}

impl Trigger {
    pub const ALL: [Trigger; 2] = [Trigger::Motion, Trigger::Manual];

    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Motion => "motion",
            Trigger::Manual => "manual",
        }
    }

    fn from_dir(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

/// One finalized clip on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingEntry {
    pub camera_id: String,
    pub trigger: Trigger,
    /// Path relative to the recordings root, `/`-separated
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
    root: PathBuf,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clip_dir(&self, camera_id: &str, trigger: Trigger) -> PathBuf {
        self.root.join(camera_id).join(trigger.as_str())
    }

    /// Reserve a final clip path for a clip starting at `at`, creating the
    /// directory if needed. Neither the final nor the partial name exists yet.
    pub fn allocate(
        &self,
        camera_id: &str,
        trigger: Trigger,
        at: DateTime<Local>,
    ) -> io::Result<PathBuf> {
        let dir = self.clip_dir(camera_id, trigger);
        fs::create_dir_all(&dir)?;

        let stem = format!("{}_{}", trigger.as_str(), at.format("%Y%m%d_%H%M%S"));
        for suffix in 0..MAX_NAME_SUFFIX {
            let name = if suffix == 0 {
                format!("{stem}.{CLIP_EXTENSION}")
            } else {
                format!("{stem}_{suffix}.{CLIP_EXTENSION}")
            };
            let path = dir.join(name);
            if !path.exists() && !partial_path(&path).exists() {
                return Ok(path);
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free clip name for {stem} in {}", dir.display()),
        ))
    }

    /// Every finalized clip, newest first.
    pub fn list(&self) -> io::Result<Vec<RecordingEntry>> {
        let mut entries = Vec::new();

        for camera in read_dir_if_exists(&self.root)? {
            let camera = camera?;
            let Some(camera_id) = camera.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !camera.file_type()?.is_dir() || !is_valid_camera_id(&camera_id) {
                continue;
            }

            for trigger in Trigger::ALL {
                let dir = camera.path().join(trigger.as_str());
                for file in read_dir_if_exists(&dir)? {
                    let file = file?;
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(CLIP_EXTENSION) {
                        continue;
                    }
                    let metadata = file.metadata()?;
                    if !metadata.is_file() {
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };

                    let created_at = parse_clip_time(name).unwrap_or_else(|| {
                        metadata
                            .modified()
                            .map(DateTime::<Local>::from)
                            .unwrap_or_else(|_| Local::now())
                    });

                    entries.push(RecordingEntry {
                        camera_id: camera_id.clone(),
                        trigger,
                        filename: format!("{}/{}/{}", camera_id, trigger.as_str(), name),
                        size_bytes: metadata.len(),
                        created_at,
                    });
                }
            }
        }

        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(entries)
    }

    /// Map a listing filename back to a path, refusing anything that could
    /// escape the store.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, ControlError> {
        let invalid = || ControlError::InvalidRecordingName(filename.to_string());
        let relative = Path::new(filename);

        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str().ok_or_else(invalid),
                _ => Err(invalid()),
            })
            .collect::<Result<_, _>>()?;

        let [camera_id, trigger, name] = parts.as_slice() else {
            return Err(invalid());
        };
        if !is_valid_camera_id(camera_id)
            || Trigger::from_dir(trigger).is_none()
            || Path::new(name).extension().and_then(|e| e.to_str()) != Some(CLIP_EXTENSION)
        {
            return Err(invalid());
        }

        Ok(self.root.join(camera_id).join(trigger).join(name))
    }

    /// Open a finalized clip for streaming to a client.
    pub fn open(&self, filename: &str) -> Result<File, ControlError> {
        let path = self.resolve(filename)?;
        Ok(File::open(path)?)
    }

    /// Delete partial files left behind by a crash. They were never
    /// finalized and cannot be played.
    pub fn sweep_partials(&self) -> io::Result<usize> {
        let mut removed = 0;
        for camera in read_dir_if_exists(&self.root)? {
            let camera = camera?;
            if !camera.file_type()?.is_dir() {
                continue;
            }
            for trigger in Trigger::ALL {
                for file in read_dir_if_exists(&camera.path().join(trigger.as_str()))? {
                    let path = file?.path();
                    if path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_EXTENSION) {
                        match fs::remove_file(&path) {
                            Ok(()) => {
                                warn!("Removed unfinished clip {}", path.display());
                                removed += 1;
                            }
                            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

/// In-progress name for a clip: `<final>.part`.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_EXTENSION);
    PathBuf::from(name)
}

/// Start time encoded in `<trigger>_<YYYYMMDD>_<HHMMSS>[_n].avi`.
fn parse_clip_time(name: &str) -> Option<DateTime<Local>> {
    let stem = name.strip_suffix(CLIP_EXTENSION)?.strip_suffix('.')?;
    let mut parts = stem.split('_');
    Trigger::from_dir(parts.next()?)?;
    let date = parts.next()?;
    let time = parts.next()?;
    let naive = NaiveDateTime::parse_from_str(&format!("{date}_{time}"), "%Y%m%d_%H%M%S").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

fn read_dir_if_exists(dir: &Path) -> io::Result<Box<dyn Iterator<Item = io::Result<fs::DirEntry>>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(Box::new(entries)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("{} does not exist yet", dir.display());
            Ok(Box::new(std::iter::empty()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, s).earliest().unwrap()
    }

    #[test]
    fn test_allocate_follows_naming_convention() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let path = store.allocate("cam1", Trigger::Motion, at(9, 5, 7)).unwrap();
        assert_eq!(
            path,
            dir.path().join("cam1/motion/motion_20260314_090507.avi")
        );
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_allocate_avoids_collisions() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let first = store.allocate("cam1", Trigger::Manual, at(9, 5, 7)).unwrap();
        fs::write(partial_path(&first), b"x").unwrap();
        let second = store.allocate("cam1", Trigger::Manual, at(9, 5, 7)).unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("manual_20260314_090507_1.avi"));
        assert_eq!(parse_clip_time("manual_20260314_090507_1.avi"), Some(at(9, 5, 7)));
    }

    #[test]
    fn test_list_newest_first_across_cameras() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let older = store.allocate("cam1", Trigger::Motion, at(8, 0, 0)).unwrap();
        let newer = store.allocate("cam2", Trigger::Motion, at(9, 0, 0)).unwrap();
        fs::write(&older, b"older").unwrap();
        fs::write(&newer, b"newer clip").unwrap();
        // Unfinished clips are never listed
        fs::write(partial_path(&store.allocate("cam2", Trigger::Manual, at(10, 0, 0)).unwrap()), b"")
            .unwrap();

        let entries = store.list().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "cam2/motion/motion_20260314_090000.avi");
        assert_eq!(entries[0].size_bytes, 10);
        assert_eq!(entries[1].camera_id, "cam1");
        assert!(entries[0].created_at > entries[1].created_at);
    }

    #[test]
    fn test_list_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path().join("nothing-here"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = RecordingStore::new("/srv/recordings");
        for bad in [
            "../secret.avi",
            "/etc/passwd",
            "cam1/motion/../../x.avi",
            "cam1/other/motion_1.avi",
            "cam1/motion/motion_1.txt",
            "motion_1.avi",
        ] {
            assert!(
                matches!(store.resolve(bad), Err(ControlError::InvalidRecordingName(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(
            store.resolve("cam1/motion/motion_20260314_090000.avi").unwrap(),
            PathBuf::from("/srv/recordings/cam1/motion/motion_20260314_090000.avi")
        );
    }

    #[test]
    fn test_sweep_partials() {
        let dir = tempdir().unwrap();
        let store = RecordingStore::new(dir.path());
        let clip = store.allocate("cam1", Trigger::Motion, at(8, 0, 0)).unwrap();
        fs::write(partial_path(&clip), b"half").unwrap();
        fs::write(&clip.with_file_name("motion_20260314_070000.avi"), b"done").unwrap();

        assert_eq!(store.sweep_partials().unwrap(), 1);
        assert!(!partial_path(&clip).exists());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
