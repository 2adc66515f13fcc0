//! Entry point for everything outside the pipeline: owns the camera
//! sessions and the recordings store.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;
use flume::Receiver;
use tracing::{info, instrument, warn};

use crate::capture::SourceOpener;
use crate::error::ControlError;
use crate::motion::MotionEvent;
use crate::recorder::ClipRecorder;
use crate::session::{CameraSession, CameraStatus, SessionState};
use crate::storage::{RecordingEntry, RecordingStore};
use crate::{is_valid_camera_id, CameraConfig, Settings};

pub struct MonitorSupervisor {
    settings: Settings,
    opener: Arc<dyn SourceOpener>,
    store: RecordingStore,
    sessions: BTreeMap<String, CameraSession>,
    /// Last known status of cameras without a session: disabled, or stopped
    parked: BTreeMap<String, CameraStatus>,
    running: bool,
}

impl MonitorSupervisor {
    pub fn new(settings: Settings, opener: Arc<dyn SourceOpener>) -> Self {
        let store = RecordingStore::new(&settings.recording.root);
        Self {
            settings,
            opener,
            store,
            sessions: BTreeMap::new(),
            parked: BTreeMap::new(),
            running: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Start every camera listed in the settings.
    pub fn start_configured(&mut self) -> Result<(), ControlError> {
        self.start(self.settings.cameras.clone())
    }

    /// Start one session per enabled camera. Disabled cameras are reported
    /// with a `NoCamera` status. Starting with no cameras at all is allowed.
    #[instrument(skip_all, fields(cameras = configs.len()))]
    pub fn start(&mut self, configs: Vec<CameraConfig>) -> Result<(), ControlError> {
        if self.running {
            return Err(ControlError::AlreadyRunning);
        }

        let mut seen = HashSet::new();
        for config in &configs {
            if !is_valid_camera_id(&config.id) {
                return Err(ControlError::InvalidCameraId(config.id.clone()));
            }
            if !seen.insert(config.id.as_str()) {
                return Err(ControlError::DuplicateCamera(config.id.clone()));
            }
        }

        match self.store.sweep_partials() {
            Ok(0) => {}
            Ok(n) => warn!("Removed {} unfinished clips from a previous run", n),
            Err(e) => warn!("Could not scan {}: {}", self.store.root().display(), e),
        }

        let mut cores = if self.settings.capture.pin_threads {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        }
        .into_iter()
        .cycle();

        self.parked.clear();
        for config in configs {
            if !config.enabled {
                info!(camera = %config.id, "Camera disabled");
                self.parked.insert(
                    config.id.clone(),
                    CameraStatus::new(&config, SessionState::NoCamera),
                );
                continue;
            }

            let id = config.id.clone();
            let recorder = ClipRecorder::from_settings(id.clone(), &self.settings);
            match CameraSession::launch(
                config,
                &self.settings,
                self.opener.clone(),
                recorder,
                cores.next(),
            ) {
                Ok(session) => {
                    self.sessions.insert(id, session);
                }
                Err(e) => {
                    self.stop_sessions();
                    return Err(e);
                }
            }
        }

        self.running = true;
        info!("Monitoring {} cameras", self.sessions.len());
        Ok(())
    }

    /// Stop all sessions together. Open clips are finalized first.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.stop_sessions();
        self.running = false;
        info!("Monitoring stopped");
    }

    fn stop_sessions(&mut self) {
        for session in self.sessions.values() {
            session.request_stop();
        }
        for (id, mut session) in std::mem::take(&mut self.sessions) {
            session.stop();
            self.parked.insert(id, session.status());
        }
    }

    pub fn status_all(&self) -> BTreeMap<String, CameraStatus> {
        let mut all = self.parked.clone();
        for (id, session) in &self.sessions {
            all.insert(id.clone(), session.status());
        }
        all
    }

    pub fn status(&self, camera_id: &str) -> Result<CameraStatus, ControlError> {
        match self.sessions.get(camera_id) {
            Some(session) => Ok(session.status()),
            None => self
                .parked
                .get(camera_id)
                .cloned()
                .ok_or_else(|| ControlError::UnknownCamera(camera_id.to_string())),
        }
    }

    /// Start a manual clip on one camera.
    pub fn record(&self, camera_id: &str) -> Result<(), ControlError> {
        self.session(camera_id)?.trigger_manual_record()
    }

    /// Start a manual clip on every running camera.
    pub fn record_all(&self) -> BTreeMap<String, Result<(), ControlError>> {
        self.sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.trigger_manual_record()))
            .collect()
    }

    /// Switch motion detection for one camera. Takes effect at its next frame.
    pub fn set_motion_enabled(&self, camera_id: &str, enabled: bool) -> Result<(), ControlError> {
        self.session(camera_id)?.set_motion_enabled(enabled);
        Ok(())
    }

    /// Finalized clips of every camera, newest first.
    pub fn list_recordings(&self) -> Result<Vec<RecordingEntry>, ControlError> {
        Ok(self.store.list()?)
    }

    /// Open a clip by the filename reported in [`list_recordings`](Self::list_recordings).
    pub fn open_recording(&self, filename: &str) -> Result<File, ControlError> {
        self.store.open(filename)
    }

    pub fn subscribe(&self, camera_id: &str) -> Result<Receiver<Bytes>, ControlError> {
        Ok(self.session(camera_id)?.subscribe())
    }

    pub fn recent_events(&self, camera_id: &str) -> Result<Vec<MotionEvent>, ControlError> {
        Ok(self.session(camera_id)?.recent_events())
    }

    fn session(&self, camera_id: &str) -> Result<&CameraSession, ControlError> {
        match self.sessions.get(camera_id) {
            Some(session) => Ok(session),
            None if self.is_configured(camera_id) => {
                Err(ControlError::NotRunning(camera_id.to_string()))
            }
            None => Err(ControlError::UnknownCamera(camera_id.to_string())),
        }
    }

    fn is_configured(&self, camera_id: &str) -> bool {
        self.parked.contains_key(camera_id)
            || self.settings.cameras.iter().any(|c| c.id == camera_id)
    }
}

impl Drop for MonitorSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
