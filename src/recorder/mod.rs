//! Fixed-duration clip recording for one camera.
//!
//! A clip opens on motion (or a manual request), takes every following frame
//! until it covers the configured duration, then closes. Frames are written to
//! `<final>.part`; the rename to the final name happens only after the sink is
//! flushed and synced.

pub mod avi;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use avi::{AviSinkFactory, AviWriter};
#[cfg(feature = "gstreamer-pipeline")]
pub use gst::{GstClipWriter, GstSinkFactory};

use crate::capture::Frame;
use crate::error::RecordError;
use crate::storage::{partial_path, RecordingStore, Trigger};
use crate::Settings;

/// Destination for the frames of one clip.
pub trait ClipSink: Send {
    fn append(&mut self, frame: &Frame) -> io::Result<()>;

    /// Flush, index and sync the clip. `span` is the time the written
    /// frames cover. Returns the final size in bytes.
    fn finish(self: Box<Self>, span: Duration) -> io::Result<u64>;
}

/// Opens a [`ClipSink`] at a path, sized from the clip's first frame.
pub trait SinkFactory: Send + Sync {
    fn create(
        &self,
        path: &Path,
        first: &Frame,
        nominal_period: Duration,
    ) -> io::Result<Box<dyn ClipSink>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecorderState {
    Idle,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClipState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClipHandle {
    pub camera_id: String,
    pub trigger: Trigger,
    pub path: PathBuf,
    pub partial_path: PathBuf,
    pub started_at: DateTime<Local>,
    pub start: Instant,
    /// Timestamp of the most recent frame written
    pub last: Instant,
    pub frames_written: u32,
    pub size_bytes: u64,
    pub state: ClipState,
}

impl ClipHandle {
    /// Time covered by the written frames, counting the last one's period.
    pub fn covered(&self, frame_period: Duration) -> Duration {
        self.last.saturating_duration_since(self.start) + frame_period
    }
}

/// What a call to [`ClipRecorder::process`] did
#[derive(Debug)]
pub enum RecorderEvent {
    Idle,
    Started(Trigger),
    Appended,
    Finished(ClipHandle),
}

struct OpenClip {
    handle: ClipHandle,
    sink: Box<dyn ClipSink>,
}

pub struct ClipRecorder {
    camera_id: String,
    store: RecordingStore,
    sinks: Arc<dyn SinkFactory>,
    clip_duration: Duration,
    frame_period: Duration,
    state: RecorderState,
    clip: Option<OpenClip>,
    open_clips: Arc<AtomicUsize>,
    motion_while_recording: u64,
}

impl ClipRecorder {
    pub fn new(
        camera_id: impl Into<String>,
        store: RecordingStore,
        sinks: Arc<dyn SinkFactory>,
        clip_duration: Duration,
        frame_period: Duration,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            store,
            sinks,
            clip_duration,
            frame_period,
            state: RecorderState::Idle,
            clip: None,
            open_clips: Arc::new(AtomicUsize::new(0)),
            motion_while_recording: 0,
        }
    }

    /// Recorder writing AVI clips under the configured recordings root.
    pub fn from_settings(camera_id: impl Into<String>, settings: &Settings) -> Self {
        Self::new(
            camera_id,
            RecordingStore::new(&settings.recording.root),
            default_sinks(settings.recording.jpeg_quality),
            settings.recording.clip_duration(),
            settings.capture.frame_period(),
        )
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.clip.is_some()
    }

    pub fn current(&self) -> Option<&ClipHandle> {
        self.clip.as_ref().map(|c| &c.handle)
    }

    /// Number of clips currently open; never more than one.
    pub fn open_clips(&self) -> usize {
        self.open_clips.load(Ordering::Acquire)
    }

    /// Motion frames seen while a clip was already open
    pub fn motion_while_recording(&self) -> u64 {
        self.motion_while_recording
    }

    /// Open a clip starting at `frame`. The frame itself is written by the
    /// next [`process`](Self::process) call.
    #[instrument(skip(self, frame), fields(camera = %self.camera_id))]
    pub fn begin(&mut self, trigger: Trigger, frame: &Frame) -> Result<(), RecordError> {
        if self.clip.is_some() {
            return Err(RecordError::AlreadyRecording);
        }

        let path = self
            .store
            .allocate(&self.camera_id, trigger, frame.captured_at)
            .map_err(|e| RecordError::storage(self.store.clip_dir(&self.camera_id, trigger), e))?;
        let partial = partial_path(&path);

        let sink = match self.sinks.create(&partial, frame, self.frame_period) {
            Ok(sink) => sink,
            Err(e) => {
                discard(&partial);
                metrics::counter!("argus_clips_abandoned_total", "camera" => self.camera_id.clone())
                    .increment(1);
                return Err(RecordError::storage(path, e));
            }
        };

        info!("Recording {} clip to {}", trigger.as_str(), path.display());
        self.clip = Some(OpenClip {
            handle: ClipHandle {
                camera_id: self.camera_id.clone(),
                trigger,
                path,
                partial_path: partial,
                started_at: frame.captured_at,
                start: frame.timestamp,
                last: frame.timestamp,
                frames_written: 0,
                size_bytes: 0,
                state: ClipState::Open,
            },
            sink,
        });
        self.state = RecorderState::Recording;
        let open = self.open_clips.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(open <= 1);
        metrics::gauge!("argus_open_clips", "camera" => self.camera_id.clone()).set(open as f64);
        Ok(())
    }

    /// Feed one frame. Idle recorders open a motion clip when `is_motion`;
    /// recording ones append the frame whatever `is_motion` says.
    pub fn process(&mut self, frame: &Frame, is_motion: bool) -> Result<RecorderEvent, RecordError> {
        let started = match (self.is_recording(), is_motion) {
            (false, true) => {
                self.begin(Trigger::Motion, frame)?;
                true
            }
            (false, false) => return Ok(RecorderEvent::Idle),
            (true, false) => false,
            (true, true) => {
                self.motion_while_recording += 1;
                debug!(
                    camera = %self.camera_id,
                    count = self.motion_while_recording,
                    "Motion while recording, clip continues"
                );
                false
            }
        };

        self.append(frame)?;

        let done = self
            .current()
            .is_some_and(|h| h.covered(self.frame_period) >= self.clip_duration);
        if done {
            return Ok(match self.finalize()? {
                Some(handle) => RecorderEvent::Finished(handle),
                None => RecorderEvent::Idle,
            });
        }

        Ok(if started {
            RecorderEvent::Started(Trigger::Motion)
        } else {
            RecorderEvent::Appended
        })
    }

    /// Close the open clip, if any, and move it to its final name.
    pub fn finalize(&mut self) -> Result<Option<ClipHandle>, RecordError> {
        let Some(OpenClip { mut handle, sink }) = self.clip.take() else {
            return Ok(None);
        };
        self.state = RecorderState::Finalizing;

        let span = handle.covered(self.frame_period);
        let outcome = sink
            .finish(span)
            .and_then(|size| fs::rename(&handle.partial_path, &handle.path).map(|()| size));
        self.closed();

        match outcome {
            Ok(size) => {
                handle.size_bytes = size;
                handle.state = ClipState::Closed;
                metrics::counter!(
                    "argus_clips_total",
                    "camera" => self.camera_id.clone(),
                    "trigger" => handle.trigger.as_str()
                )
                .increment(1);
                info!(
                    camera = %self.camera_id,
                    "Saved {} ({} frames, {:.1}s, {} bytes)",
                    handle.path.display(),
                    handle.frames_written,
                    span.as_secs_f32(),
                    size
                );
                Ok(Some(handle))
            }
            Err(e) => {
                discard(&handle.partial_path);
                metrics::counter!("argus_clips_abandoned_total", "camera" => self.camera_id.clone())
                    .increment(1);
                warn!(camera = %self.camera_id, "Abandoned clip {}: {}", handle.path.display(), e);
                Err(RecordError::storage(handle.path, e))
            }
        }
    }

    fn append(&mut self, frame: &Frame) -> Result<(), RecordError> {
        let result = match self.clip.as_mut() {
            Some(clip) => clip.sink.append(frame).map(|()| {
                clip.handle.frames_written += 1;
                clip.handle.last = frame.timestamp;
            }),
            None => Ok(()),
        };
        result.map_err(|e| self.abandon(e))
    }

    fn abandon(&mut self, error: io::Error) -> RecordError {
        let Some(OpenClip { handle, sink }) = self.clip.take() else {
            return RecordError::storage(PathBuf::new(), error);
        };
        drop(sink);
        discard(&handle.partial_path);
        self.closed();

        metrics::counter!("argus_clips_abandoned_total", "camera" => self.camera_id.clone())
            .increment(1);
        warn!(
            camera = %self.camera_id,
            "Abandoned clip {} after {} frames: {}",
            handle.path.display(),
            handle.frames_written,
            error
        );
        RecordError::storage(handle.path, error)
    }

    fn closed(&mut self) {
        let open = self.open_clips.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("argus_open_clips", "camera" => self.camera_id.clone()).set(open as f64);
        self.state = RecorderState::Idle;
    }
}

impl Drop for ClipRecorder {
    fn drop(&mut self) {
        if self.clip.is_some() {
            if let Err(e) = self.finalize() {
                warn!("Clip lost while dropping recorder: {}", e);
            }
        }
    }
}

/// GStreamer muxing when built in and usable, the built-in writer otherwise.
#[cfg(feature = "gstreamer-pipeline")]
fn default_sinks(jpeg_quality: u8) -> Arc<dyn SinkFactory> {
    match GstSinkFactory::new(jpeg_quality) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            warn!("{}, using the built-in AVI writer", e);
            Arc::new(AviSinkFactory { jpeg_quality })
        }
    }
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn default_sinks(jpeg_quality: u8) -> Arc<dyn SinkFactory> {
    Arc::new(AviSinkFactory { jpeg_quality })
}

/// Remove a partial file, tolerating one that was never created.
fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
