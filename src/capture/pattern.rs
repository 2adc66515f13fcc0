//! Synthetic camera: a bright square sweeping over a dark background.
//!
//! The square moves for a few seconds, then rests, so the pipeline sees both
//! motion and quiet periods without any hardware attached.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::FrameSource;
use crate::error::SourceError;

const BACKGROUND: u8 = 16;
const FOREGROUND: u8 = 235;
const MOVE_SECONDS: u32 = 3;
const REST_SECONDS: u32 = 12;

pub struct TestPattern {
    camera_id: Arc<str>,
    width: u32,
    height: u32,
    period: Duration,
    fps: u32,
    sequence: u64,
    next_deadline: Option<Instant>,
}

impl TestPattern {
    pub fn new(camera_id: Arc<str>, width: u32, height: u32, fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            camera_id,
            width,
            height,
            period: Duration::from_nanos(1_000_000_000 / u64::from(fps)),
            fps,
            sequence: 0,
            next_deadline: None,
        }
    }

    /// Top-left corner of the square for a given frame number.
    fn square_origin(&self, sequence: u64) -> (u32, u32) {
        let side = self.side();
        let cycle = u64::from((MOVE_SECONDS + REST_SECONDS) * self.fps);
        let moving = u64::from(MOVE_SECONDS * self.fps);
        let step = sequence % cycle;
        let travel = u64::from(self.width.saturating_sub(side).max(1));
        // Position freezes at the end of the sweep while resting
        let progress = step.min(moving);
        let x = (progress * travel / moving.max(1)) as u32;
        let y = (self.height.saturating_sub(side)) / 2;
        (x.min(self.width.saturating_sub(side)), y)
    }

    fn side(&self) -> u32 {
        (self.width.min(self.height) / 4).max(1)
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let (width, height) = (self.width as usize, self.height as usize);
        let mut data = vec![BACKGROUND; width * height * 3];
        let side = self.side() as usize;
        let (x0, y0) = self.square_origin(sequence);
        let (x0, y0) = (x0 as usize, y0 as usize);
        for y in y0..(y0 + side).min(height) {
            let row = &mut data[y * width * 3..(y + 1) * width * 3];
            row[x0 * 3..(x0 + side).min(width) * 3].fill(FOREGROUND);
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + self.period);

        let data = self.render(self.sequence);
        self.sequence += 1;

        Ok(Frame::new(
            self.camera_id.clone(),
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            Bytes::from(data),
        ))
    }

    fn describe(&self) -> String {
        format!("test-pattern {}x{}@{}", self.width, self.height, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_square_moves_then_rests() {
        let pattern = TestPattern::new(Arc::from("cam"), 64, 48, 10);
        let start = pattern.square_origin(0);
        let mid = pattern.square_origin(15);
        let end = pattern.square_origin(30);
        let rest = pattern.square_origin(60);
        assert!(mid.0 > start.0);
        assert_eq!(end, rest);
    }

    #[test]
    fn test_frames_have_expected_shape() {
        let mut pattern = TestPattern::new(Arc::from("cam"), 32, 24, 1000);
        let frame = pattern.next_frame().unwrap();
        assert_eq!(frame.data.len(), 32 * 24 * 3);
        assert_eq!(frame.format(), PixelFormat::Rgb24);
        assert_eq!(frame.meta.sequence, 1);
        assert!(frame.data.iter().any(|&b| b == FOREGROUND));
    }
}
