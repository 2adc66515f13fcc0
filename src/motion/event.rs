//! Folding per-frame motion results into motion events.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::detector::{MotionResult, Rect};
use crate::capture::Frame;

/// A contiguous interval of motion on one camera
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionEvent {
    pub camera_id: String,
    pub started_at: DateTime<Local>,
    /// `None` while the event is still open
    pub ended_at: Option<DateTime<Local>>,
    /// Union of every region reported during the event
    pub region: Option<Rect>,
    pub peak_area: u32,
    pub motion_frames: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerUpdate {
    Idle,
    Opened,
    Extended,
    Closed(MotionEvent),
}

pub struct MotionTracker {
    camera_id: String,
    debounce: Duration,
    current: Option<MotionEvent>,
    last_motion: Option<(Instant, DateTime<Local>)>,
}

impl MotionTracker {
    pub fn new(camera_id: impl Into<String>, debounce: Duration) -> Self {
        Self {
            camera_id: camera_id.into(),
            debounce,
            current: None,
            last_motion: None,
        }
    }

    pub fn current(&self) -> Option<&MotionEvent> {
        self.current.as_ref()
    }

    pub fn observe(&mut self, frame: &Frame, result: &MotionResult) -> TrackerUpdate {
        if result.is_motion {
            self.last_motion = Some((frame.timestamp, frame.captured_at));
            return match self.current.as_mut() {
                Some(event) => {
                    event.motion_frames += 1;
                    event.peak_area = event.peak_area.max(result.area);
                    event.region = match (event.region, result.region) {
                        (Some(a), Some(b)) => Some(a.union(&b)),
                        (a, b) => a.or(b),
                    };
                    TrackerUpdate::Extended
                }
                None => {
                    self.current = Some(MotionEvent {
                        camera_id: self.camera_id.clone(),
                        started_at: frame.captured_at,
                        ended_at: None,
                        region: result.region,
                        peak_area: result.area,
                        motion_frames: 1,
                    });
                    TrackerUpdate::Opened
                }
            };
        }

        match self.last_motion {
            Some((last, _))
                if self.current.is_some()
                    && frame.timestamp.saturating_duration_since(last) >= self.debounce =>
            {
                self.close_at_last_motion()
                    .map_or(TrackerUpdate::Idle, TrackerUpdate::Closed)
            }
            _ => TrackerUpdate::Idle,
        }
    }

    /// Close the open event, if any, ending it at `at`.
    pub fn close(&mut self, at: DateTime<Local>) -> Option<MotionEvent> {
        let mut event = self.current.take()?;
        event.ended_at = Some(at);
        self.last_motion = None;
        Some(event)
    }

    fn close_at_last_motion(&mut self) -> Option<MotionEvent> {
        let (_, at) = self.last_motion?;
        self.close(at)
    }
}
