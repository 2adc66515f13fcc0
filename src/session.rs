//! Per-camera pipeline: capture → motion → recording → live feed.
//!
//! Each session runs two named threads. The capture thread owns the
//! [`FrameSource`] and does the blocking reads; the pump thread owns the
//! detector, tracker and recorder and is the only writer of the published
//! [`CameraStatus`]. Control calls only flip atomics that the pump acts on at
//! the next frame boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Local};
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::capture::{Frame, FrameSource, SourceOpener};
use crate::error::{ControlError, RecordError, SourceError};
use crate::motion::{MotionDetector, MotionEvent, MotionResult, MotionTracker, TrackerUpdate};
use crate::recorder::{ClipRecorder, RecorderEvent};
use crate::storage::Trigger;
use crate::stream::LiveFeed;
use crate::{CameraConfig, CaptureConfig, Settings};

/// How often the pump wakes up to check the stop flag while waiting for a frame
const POLL_TICK: Duration = Duration::from_millis(50);
/// Closed motion events kept per camera
const EVENT_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Camera is configured but disabled
    NoCamera,
    Connecting,
    Streaming,
    /// The device failed; the session is no longer producing frames
    Disconnected,
    Stopped,
}

/// Point-in-time view of one camera, safe to hand to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub label: String,
    pub state: SessionState,
    pub connected: bool,
    pub recording: bool,
    /// Whether frames are checked for motion at all
    pub motion_enabled: bool,
    /// Whether the most recent frame showed motion
    pub motion: bool,
    pub last_error: Option<String>,
    /// Device the session opened
    pub device: Option<String>,
    pub frames_processed: u64,
    pub clips_written: u64,
    pub last_frame_at: Option<DateTime<Local>>,
}

impl CameraStatus {
    pub fn new(config: &CameraConfig, state: SessionState) -> Self {
        Self {
            camera_id: config.id.clone(),
            label: config.display_label().to_string(),
            state,
            connected: false,
            recording: false,
            motion_enabled: config.motion_detection,
            motion: false,
            last_error: None,
            device: None,
            frames_processed: 0,
            clips_written: 0,
            last_frame_at: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    clips: AtomicU64,
    capture_errors: AtomicU64,
}

/// State shared between the session handle and its threads
struct Shared {
    status: ArcSwap<CameraStatus>,
    counters: CachePadded<Counters>,
    stop: AtomicBool,
    running: AtomicBool,
    /// Set by `trigger_manual_record`, consumed by the pump
    manual_pending: AtomicBool,
    /// True from an accepted manual request or a clip start until the clip
    /// is closed or abandoned
    clip_busy: AtomicBool,
    motion_enabled: AtomicBool,
    events: Mutex<VecDeque<MotionEvent>>,
    feed: LiveFeed,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn push_event(&self, event: MotionEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() == EVENT_HISTORY {
            events.pop_front();
        }
        events.push_back(event);
    }
}

pub struct CameraSession {
    camera_id: String,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
    subscriber_capacity: usize,
}

impl CameraSession {
    /// Start a session recording AVI clips under the configured root.
    pub fn start(
        config: CameraConfig,
        settings: &Settings,
        opener: Arc<dyn SourceOpener>,
    ) -> Result<Self, ControlError> {
        let recorder = ClipRecorder::from_settings(config.id.clone(), settings);
        Self::launch(config, settings, opener, recorder, None)
    }

    /// Start a session around an already configured recorder.
    pub fn start_with_recorder(
        config: CameraConfig,
        settings: &Settings,
        opener: Arc<dyn SourceOpener>,
        recorder: ClipRecorder,
    ) -> Result<Self, ControlError> {
        Self::launch(config, settings, opener, recorder, None)
    }

    pub(crate) fn launch(
        config: CameraConfig,
        settings: &Settings,
        opener: Arc<dyn SourceOpener>,
        recorder: ClipRecorder,
        core: Option<core_affinity::CoreId>,
    ) -> Result<Self, ControlError> {
        let camera_id = config.id.clone();
        let shared = Arc::new(Shared {
            status: ArcSwap::from_pointee(CameraStatus::new(&config, SessionState::Connecting)),
            counters: CachePadded::new(Counters::default()),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            manual_pending: AtomicBool::new(false),
            clip_busy: AtomicBool::new(false),
            motion_enabled: AtomicBool::new(config.motion_detection),
            events: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY)),
            feed: LiveFeed::new(camera_id.clone(), settings.stream.jpeg_quality),
        });

        let pump = Pump {
            status: CameraStatus::new(&config, SessionState::Connecting),
            detector: MotionDetector::new(settings.motion.clone()),
            tracker: MotionTracker::new(camera_id.clone(), settings.motion.debounce()),
            recorder,
            detecting: config.motion_detection,
            last_frame: None,
            shared: shared.clone(),
            capture: settings.capture.clone(),
            config,
        };

        let handle = thread::Builder::new()
            .name(format!("argus-{camera_id}-pump"))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        warn!("Could not pin pump thread to core {}", core.id);
                    }
                }
                pump.run(opener)
            })
            .map_err(ControlError::Spawn)?;

        Ok(Self {
            camera_id,
            shared,
            pump: Some(handle),
            subscriber_capacity: settings.stream.subscriber_capacity,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// True until the session is stopped or its device fails.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.shared.stopping()
    }

    pub fn status(&self) -> CameraStatus {
        let mut status = CameraStatus::clone(&self.shared.status.load());
        let running = self.shared.running.load(Ordering::SeqCst);
        status.frames_processed = self.shared.counters.frames.load(Ordering::Relaxed);
        status.clips_written = self.shared.counters.clips.load(Ordering::Relaxed);
        status.recording = running && self.shared.clip_busy.load(Ordering::Acquire);
        status.motion_enabled = self.shared.motion_enabled.load(Ordering::Relaxed);
        status
    }

    /// Ask for a manual clip starting at the next frame, or at the last
    /// frame seen if the session stops first.
    pub fn trigger_manual_record(&self) -> Result<(), ControlError> {
        // No frame yet means nothing to start a clip from
        if !self.is_running() || self.shared.counters.frames.load(Ordering::Relaxed) == 0 {
            return Err(ControlError::NotRunning(self.camera_id.clone()));
        }
        if self
            .shared
            .clip_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControlError::AlreadyRecording(self.camera_id.clone()));
        }
        self.shared.manual_pending.store(true, Ordering::SeqCst);

        // The pump may have shut down since the check above. Whoever clears
        // `manual_pending` first owns the request.
        if !self.is_running() && self.shared.manual_pending.swap(false, Ordering::SeqCst) {
            self.shared.clip_busy.store(false, Ordering::Release);
            return Err(ControlError::NotRunning(self.camera_id.clone()));
        }
        info!(camera = %self.camera_id, "Manual recording requested");
        Ok(())
    }

    /// Switch motion detection on or off from the next frame. While off, no
    /// motion clips start; manual recording still works.
    pub fn set_motion_enabled(&self, enabled: bool) {
        let was = self.shared.motion_enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!(camera = %self.camera_id, enabled, "Motion detection toggled");
        }
    }

    /// Live JPEG frames. The receiver disconnects when the session ends.
    pub fn subscribe(&self) -> Receiver<Bytes> {
        self.shared.feed.subscribe(self.subscriber_capacity)
    }

    /// Closed motion events, newest first.
    pub fn recent_events(&self) -> Vec<MotionEvent> {
        let events = self.shared.events.lock().unwrap_or_else(|p| p.into_inner());
        events.iter().rev().cloned().collect()
    }

    /// Signal the pump to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Stop the pump, finalizing any open clip, and wait for it to exit.
    pub fn stop(&mut self) {
        self.request_stop();
        let Some(handle) = self.pump.take() else {
            return;
        };

        if handle.join().is_err() {
            error!(camera = %self.camera_id, "Pump thread panicked");
        }

        let mut status = CameraStatus::clone(&self.shared.status.load());
        status.state = SessionState::Stopped;
        status.connected = false;
        status.motion = false;
        self.shared.status.store(Arc::new(status));
        info!(camera = %self.camera_id, "Session stopped");
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the pump thread owns
struct Pump {
    config: CameraConfig,
    capture: CaptureConfig,
    shared: Arc<Shared>,
    detector: MotionDetector,
    tracker: MotionTracker,
    recorder: ClipRecorder,
    /// Motion detection setting the detector last ran with
    detecting: bool,
    last_frame: Option<Frame>,
    /// Pump-side copy of the published status
    status: CameraStatus,
}

impl Pump {
    fn run(mut self, opener: Arc<dyn SourceOpener>) {
        let span = info_span!("session", camera = %self.config.id);
        let _enter = span.enter();

        let source = match opener.open(&self.config, &self.capture) {
            Ok(source) => source,
            Err(e) => {
                error!("Could not start camera: {}", e);
                self.shutdown(Some(e));
                return;
            }
        };
        self.status.device = Some(source.describe());
        info!("Streaming from {}", source.describe());

        let (tx, rx) = flume::bounded(self.capture.channel_capacity.max(1));
        let capture = match spawn_capture(&self.config.id, source, tx, self.shared.clone(), &self.capture)
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shutdown(Some(SourceError::DeviceUnavailable {
                    camera: self.config.id.clone(),
                    reason: format!("capture thread: {e}"),
                }));
                return;
            }
        };

        let failure = self.pump_frames(&rx);
        drop(rx);
        self.shutdown(failure);
        self.reap_capture(capture);
    }

    /// Process frames until stopped or the device fails.
    fn pump_frames(&mut self, rx: &Receiver<Result<Frame, SourceError>>) -> Option<SourceError> {
        let timeout = self.capture.frame_timeout();
        let mut last_frame = Instant::now();

        while !self.shared.stopping() {
            match rx.recv_timeout(POLL_TICK) {
                Ok(Ok(frame)) => {
                    last_frame = Instant::now();
                    self.handle_frame(&frame);
                }
                Ok(Err(SourceError::Capture(reason))) => {
                    self.status.last_error = Some(reason);
                }
                Ok(Err(e)) => return Some(e),
                Err(RecvTimeoutError::Timeout) => {
                    if last_frame.elapsed() >= timeout {
                        return Some(SourceError::DeviceUnavailable {
                            camera: self.config.id.clone(),
                            reason: format!("no frame within {:?}", timeout),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(SourceError::DeviceUnavailable {
                        camera: self.config.id.clone(),
                        reason: "capture thread exited".to_string(),
                    });
                }
            }
        }
        None
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let camera = self.config.id.clone();
        self.shared.counters.frames.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("argus_frames_total", "camera" => camera.clone()).increment(1);

        if self.shared.manual_pending.swap(false, Ordering::AcqRel) {
            match self.recorder.begin(Trigger::Manual, frame) {
                Ok(()) => {}
                // Absorbed into the clip that is already running
                Err(RecordError::AlreadyRecording) => debug!("Manual request joined open clip"),
                Err(e) => self.record_failed(e),
            }
        }

        let enabled = self.shared.motion_enabled.load(Ordering::Acquire);
        if enabled != self.detecting {
            // Stale reference after a pause would read as motion
            self.detector.reset();
            self.detecting = enabled;
        }
        let result = if enabled {
            let started = Instant::now();
            let result = self.detector.detect(frame);
            metrics::histogram!("argus_detect_time_us", "camera" => camera)
                .record(started.elapsed().as_micros() as f64);
            result
        } else {
            MotionResult::default()
        };

        match self.tracker.observe(frame, &result) {
            TrackerUpdate::Opened => debug!("Motion started"),
            TrackerUpdate::Closed(event) => self.shared.push_event(event),
            TrackerUpdate::Idle | TrackerUpdate::Extended => {}
        }

        match self.recorder.process(frame, result.is_motion) {
            Ok(RecorderEvent::Started(_)) => self.shared.clip_busy.store(true, Ordering::Release),
            Ok(RecorderEvent::Finished(_)) => {
                self.shared.counters.clips.fetch_add(1, Ordering::Relaxed);
                self.shared.clip_busy.store(false, Ordering::Release);
                if let Some(event) = self.tracker.close(frame.captured_at) {
                    self.shared.push_event(event);
                }
            }
            Ok(RecorderEvent::Idle | RecorderEvent::Appended) => {}
            Err(e) => self.record_failed(e),
        }

        self.shared.feed.publish(frame);
        self.last_frame = Some(frame.clone());

        self.status.state = SessionState::Streaming;
        self.status.connected = true;
        self.status.motion = result.is_motion;
        self.status.last_frame_at = Some(frame.captured_at);
        self.publish();
    }

    fn record_failed(&mut self, e: RecordError) {
        error!("Recording failed: {}", e);
        self.shared.clip_busy.store(false, Ordering::Release);
        self.status.last_error = Some(e.to_string());
    }

    /// Close out recording state and publish the final status.
    fn shutdown(&mut self, failure: Option<SourceError>) {
        // From here on no manual request can be accepted
        self.shared.running.store(false, Ordering::SeqCst);
        if self.shared.manual_pending.swap(false, Ordering::SeqCst) {
            self.record_last_frame();
        }

        match self.recorder.finalize() {
            Ok(Some(_)) => {
                self.shared.counters.clips.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Recording failed: {}", e);
                self.status.last_error = Some(e.to_string());
            }
        }
        if let Some(event) = self.tracker.close(Local::now()) {
            self.shared.push_event(event);
        }
        self.shared.clip_busy.store(false, Ordering::Release);
        self.shared.feed.close();

        self.status.connected = false;
        self.status.motion = false;
        self.status.state = match failure {
            Some(e) => {
                warn!("Camera disconnected: {}", e);
                self.status.last_error = Some(e.to_string());
                SessionState::Disconnected
            }
            None => SessionState::Stopped,
        };
        self.publish();
    }

    /// Honor a manual request that arrived after the last processed frame:
    /// the clip holds that frame alone and is finalized with the session.
    fn record_last_frame(&mut self) {
        let Some(frame) = self.last_frame.take() else {
            warn!("Manual recording dropped, no frame was captured");
            return;
        };
        match self.recorder.begin(Trigger::Manual, &frame) {
            Ok(()) => {}
            Err(RecordError::AlreadyRecording) => return,
            Err(e) => {
                self.record_failed(e);
                return;
            }
        }
        match self.recorder.process(&frame, false) {
            Ok(RecorderEvent::Finished(_)) => {
                self.shared.counters.clips.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => self.record_failed(e),
        }
    }

    /// Join the capture thread if it exits promptly; leave it detached when
    /// it is stuck inside the driver.
    fn reap_capture(&self, capture: JoinHandle<()>) {
        let deadline = Instant::now() + self.capture.frame_timeout();
        while !capture.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if capture.is_finished() {
            if capture.join().is_err() {
                error!("Capture thread panicked");
            }
        } else {
            warn!("Capture thread did not exit, detaching it");
        }
    }

    fn publish(&self) {
        self.shared.status.store(Arc::new(self.status.clone()));
    }
}

fn spawn_capture(
    camera_id: &str,
    mut source: Box<dyn FrameSource>,
    tx: Sender<Result<Frame, SourceError>>,
    shared: Arc<Shared>,
    config: &CaptureConfig,
) -> std::io::Result<JoinHandle<()>> {
    let camera = camera_id.to_string();
    let max_errors = config.max_capture_errors;

    thread::Builder::new()
        .name(format!("argus-{camera_id}-capture"))
        .spawn(move || {
            let mut consecutive_errors = 0u32;
            while !shared.stopping() {
                let message = match source.next_frame() {
                    Ok(frame) => {
                        consecutive_errors = 0;
                        Ok(frame)
                    }
                    Err(SourceError::Capture(reason)) => {
                        consecutive_errors += 1;
                        shared.counters.capture_errors.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("argus_capture_errors_total", "camera" => camera.clone())
                            .increment(1);
                        warn!(camera = %camera, "Capture error {}: {}", consecutive_errors, reason);
                        if consecutive_errors > max_errors {
                            Err(SourceError::DeviceUnavailable {
                                camera: camera.clone(),
                                reason: format!(
                                    "{consecutive_errors} consecutive capture errors, last: {reason}"
                                ),
                            })
                        } else {
                            Err(SourceError::Capture(reason))
                        }
                    }
                    Err(e) => Err(e),
                };

                let fatal = matches!(
                    message,
                    Err(SourceError::DeviceUnavailable { .. } | SourceError::EndOfStream)
                );
                if tx.send(message).is_err() || fatal {
                    break;
                }
            }
            source.close();
            debug!(camera = %camera, "Capture thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::recorder::{ClipSink, SinkFactory};
    use crate::storage::{RecordingStore, PARTIAL_EXTENSION};
    use crate::{DeviceSpec, SourceKind};
    use std::io;
    use std::path::Path;

    const W: u32 = 64;
    const H: u32 = 48;

    /// Plays a fixed list of frames with synthetic timestamps, then repeats
    /// the last one, or ends with `then`.
    struct ScriptedSource {
        frames: VecDeque<Vec<u8>>,
        last: Vec<u8>,
        then: Option<SourceError>,
        sequence: u64,
        base: Instant,
        period: Duration,
        /// Real time spent in each read
        delay: Duration,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame, SourceError> {
            thread::sleep(self.delay);
            let data = match self.frames.pop_front() {
                Some(data) => data,
                None => match self.then.take() {
                    Some(e) => return Err(e),
                    None => self.last.clone(),
                },
            };
            self.last = data.clone();
            let n = self.sequence;
            self.sequence += 1;
            Ok(
                Frame::new(Arc::from("cam1"), n, W, H, PixelFormat::Gray8, Bytes::from(data))
                    .with_timestamps(self.base + self.period * n as u32, Local::now()),
            )
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct ScriptedOpener(Mutex<Option<ScriptedSource>>);

    impl SourceOpener for ScriptedOpener {
        fn open(
            &self,
            camera: &CameraConfig,
            _: &CaptureConfig,
        ) -> Result<Box<dyn FrameSource>, SourceError> {
            match self.0.lock().unwrap().take() {
                Some(source) => Ok(Box::new(source)),
                None => Err(SourceError::DeviceUnavailable {
                    camera: camera.id.clone(),
                    reason: "already opened".into(),
                }),
            }
        }
    }

    fn dark() -> Vec<u8> {
        vec![10; (W * H) as usize]
    }

    fn with_block() -> Vec<u8> {
        let mut data = dark();
        for y in 12..36 {
            for x in 20..44 {
                data[(y * W + x) as usize] = 220;
            }
        }
        data
    }

    fn opener(frames: Vec<Vec<u8>>, then: Option<SourceError>) -> Arc<dyn SourceOpener> {
        slow_opener(frames, then, Duration::from_millis(1))
    }

    fn slow_opener(
        frames: Vec<Vec<u8>>,
        then: Option<SourceError>,
        delay: Duration,
    ) -> Arc<dyn SourceOpener> {
        Arc::new(ScriptedOpener(Mutex::new(Some(ScriptedSource {
            last: frames.last().cloned().unwrap_or_else(dark),
            frames: frames.into(),
            then,
            sequence: 0,
            base: Instant::now(),
            period: Duration::from_millis(100),
            delay,
        }))))
    }

    fn count_partials(root: &Path) -> usize {
        let mut count = 0;
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_EXTENSION) {
                    count += 1;
                }
            }
        }
        count
    }

    fn settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.capture.fps = 10;
        settings.capture.frame_timeout_ms = 2_000;
        settings.motion.min_area = 50;
        settings.recording.root = root.to_path_buf();
        settings.recording.clip_seconds = 10;
        settings
    }

    fn camera() -> CameraConfig {
        CameraConfig::new("cam1", SourceKind::TestPattern, DeviceSpec::default())
    }

    fn wait_for(session: &CameraSession, what: impl Fn(&CameraStatus) -> bool) -> CameraStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = session.status();
            if what(&status) || Instant::now() > deadline {
                return status;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_motion_clip_is_written_with_expected_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut frames = vec![dark()];
        frames.extend(std::iter::repeat_with(with_block).take(100));
        let session = CameraSession::start(
            camera(),
            &settings(dir.path()),
            opener(frames, Some(SourceError::EndOfStream)),
        )
        .unwrap();

        let status = wait_for(&session, |s| s.state == SessionState::Disconnected);
        assert_eq!(status.state, SessionState::Disconnected);
        assert_eq!(status.frames_processed, 101);
        assert_eq!(status.clips_written, 1);
        assert!(!status.recording);

        let clips = RecordingStore::new(dir.path()).list().unwrap();
        assert_eq!(clips.len(), 1);
        let data = std::fs::read(dir.path().join(&clips[0].filename)).unwrap();
        assert_eq!(u32::from_le_bytes(data[48..52].try_into().unwrap()), 100);
    }

    #[test]
    fn test_stop_finalizes_open_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.recording.clip_seconds = 600;
        let mut session = CameraSession::start(
            camera(),
            &settings,
            opener(vec![dark(), with_block()], None),
        )
        .unwrap();

        let status = wait_for(&session, |s| s.recording);
        assert!(status.recording);
        session.stop();

        let status = session.status();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.clips_written, 1);
        assert!(!session.is_running());

        let clips = RecordingStore::new(dir.path()).list().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].trigger, Trigger::Motion);
    }

    #[test]
    fn test_manual_record_then_already_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.recording.clip_seconds = 600;
        let mut session = CameraSession::start(camera(), &settings, opener(vec![dark()], None))
            .unwrap();

        wait_for(&session, |s| s.state == SessionState::Streaming);
        session.trigger_manual_record().unwrap();
        assert!(matches!(
            session.trigger_manual_record(),
            Err(ControlError::AlreadyRecording(_))
        ));
        assert!(session.status().recording);

        session.stop();
        assert!(matches!(
            session.trigger_manual_record(),
            Err(ControlError::NotRunning(_))
        ));
        let clips = RecordingStore::new(dir.path()).list().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].trigger, Trigger::Manual);
        assert_eq!(count_partials(dir.path()), 0);
    }

    #[test]
    fn test_manual_request_before_stop_still_writes_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.recording.clip_seconds = 600;
        // Frames arrive slowly enough that the stop lands before the next one
        let mut session = CameraSession::start(
            camera(),
            &settings,
            slow_opener(vec![dark()], None, Duration::from_millis(300)),
        )
        .unwrap();

        wait_for(&session, |s| s.frames_processed > 0);
        session.trigger_manual_record().unwrap();
        session.stop();

        let status = session.status();
        assert!(!status.recording);
        assert_eq!(status.clips_written, 1);
        let clips = RecordingStore::new(dir.path()).list().unwrap();
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].trigger, Trigger::Manual);
        assert_eq!(count_partials(dir.path()), 0);
    }

    #[test]
    fn test_manual_request_before_first_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let session = CameraSession::start(
            camera(),
            &settings(dir.path()),
            slow_opener(vec![dark()], None, Duration::from_secs(1)),
        )
        .unwrap();

        assert!(matches!(
            session.trigger_manual_record(),
            Err(ControlError::NotRunning(_))
        ));
        assert!(!session.status().recording);
    }

    #[test]
    fn test_manual_requests_during_disconnect_do_not_stick() {
        for _ in 0..30 {
            let dir = tempfile::tempdir().unwrap();
            let session = CameraSession::start(
                camera(),
                &settings(dir.path()),
                opener(vec![dark(), dark(), dark()], Some(SourceError::EndOfStream)),
            )
            .unwrap();

            let deadline = Instant::now() + Duration::from_secs(10);
            while session.status().state != SessionState::Disconnected {
                assert!(Instant::now() < deadline, "session never disconnected");
                let _ = session.trigger_manual_record();
            }

            let status = session.status();
            assert!(!status.recording);
            assert!(!session.is_running());
            assert!(matches!(
                session.trigger_manual_record(),
                Err(ControlError::NotRunning(_))
            ));
            let clips = RecordingStore::new(dir.path()).list().unwrap();
            assert_eq!(clips.len() as u64, status.clips_written);
            assert_eq!(count_partials(dir.path()), 0);
        }
    }

    #[test]
    fn test_motion_detection_switched_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        camera.motion_detection = false;
        let frames = (0..40)
            .map(|i| if i % 2 == 0 { dark() } else { with_block() })
            .collect();
        let session = CameraSession::start(camera, &settings(dir.path()), opener(frames, None))
            .unwrap();

        let status = wait_for(&session, |s| s.frames_processed >= 40);
        assert!(status.frames_processed >= 40);
        assert!(!status.motion_enabled);
        assert!(!status.recording);
        assert_eq!(status.clips_written, 0);
        assert!(session.recent_events().is_empty());

        session.set_motion_enabled(true);
        assert!(session.status().motion_enabled);
        // Manual recording is independent of detection
        session.set_motion_enabled(false);
        session.trigger_manual_record().unwrap();
        assert!(session.status().recording);
    }

    #[test]
    fn test_open_failure_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let opener: Arc<dyn SourceOpener> = Arc::new(ScriptedOpener(Mutex::new(None)));
        let session = CameraSession::start(camera(), &settings(dir.path()), opener).unwrap();

        let status = wait_for(&session, |s| s.state == SessionState::Disconnected);
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.last_error.unwrap().contains("already opened"));
        assert!(!session.is_running());
    }

    #[test]
    fn test_repeated_capture_errors_escalate() {
        struct Broken;
        impl FrameSource for Broken {
            fn next_frame(&mut self) -> Result<Frame, SourceError> {
                thread::sleep(Duration::from_millis(1));
                Err(SourceError::Capture("select timeout".into()))
            }
            fn describe(&self) -> String {
                "broken".into()
            }
        }
        struct BrokenOpener;
        impl SourceOpener for BrokenOpener {
            fn open(&self, _: &CameraConfig, _: &CaptureConfig) -> Result<Box<dyn FrameSource>, SourceError> {
                Ok(Box::new(Broken))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.capture.max_capture_errors = 3;
        let session = CameraSession::start(camera(), &settings, Arc::new(BrokenOpener)).unwrap();

        let status = wait_for(&session, |s| s.state == SessionState::Disconnected);
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.last_error.unwrap().contains("consecutive"));
        assert_eq!(session.shared.counters.capture_errors.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_capture_panic_only_disconnects_its_session() {
        struct Panicking;
        impl FrameSource for Panicking {
            fn next_frame(&mut self) -> Result<Frame, SourceError> {
                panic!("driver bug");
            }
            fn describe(&self) -> String {
                "panicking".into()
            }
        }
        struct PanickingOpener;
        impl SourceOpener for PanickingOpener {
            fn open(&self, _: &CameraConfig, _: &CaptureConfig) -> Result<Box<dyn FrameSource>, SourceError> {
                Ok(Box::new(Panicking))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let broken = CameraSession::start(camera(), &settings(dir.path()), Arc::new(PanickingOpener))
            .unwrap();
        let healthy = CameraSession::start(camera(), &settings(dir.path()), opener(vec![dark()], None))
            .unwrap();

        let status = wait_for(&broken, |s| s.state == SessionState::Disconnected);
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.last_error.unwrap().contains("capture thread exited"));

        let before = healthy.status().frames_processed;
        let after = wait_for(&healthy, |s| s.frames_processed > before + 5);
        assert!(after.frames_processed > before + 5);
        assert!(healthy.is_running());
    }

    #[test]
    fn test_storage_failure_surfaces_as_last_error() {
        struct ReadOnly;
        impl SinkFactory for ReadOnly {
            fn create(&self, _: &Path, _: &Frame, _: Duration) -> io::Result<Box<dyn ClipSink>> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let recorder = ClipRecorder::new(
            "cam1",
            RecordingStore::new(dir.path()),
            Arc::new(ReadOnly),
            settings.recording.clip_duration(),
            settings.capture.frame_period(),
        );
        let session = CameraSession::start_with_recorder(
            camera(),
            &settings,
            opener(vec![dark(), with_block()], None),
            recorder,
        )
        .unwrap();

        let status = wait_for(&session, |s| s.last_error.is_some());
        assert!(status.last_error.unwrap().contains("read-only"));
        assert!(!status.recording);
        assert!(session.is_running());
    }

    #[test]
    fn test_live_subscriber_receives_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let session = CameraSession::start(
            camera(),
            &settings(dir.path()),
            opener(vec![dark()], None),
        )
        .unwrap();

        let rx = session.subscribe();
        let jpeg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
