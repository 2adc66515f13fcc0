//! Frame-differencing motion detector.

use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::{decoder, Frame};
use crate::MotionConfig;

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Rect {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

/// Outcome of comparing one frame against the reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionResult {
    pub is_motion: bool,
    /// Bounding box of the largest changed region, when motion was found
    pub region: Option<Rect>,
    /// Pixel area of the largest changed region (reported even below the floor)
    pub area: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    NoReference,
    Ready,
}

pub struct MotionDetector {
    config: MotionConfig,
    reference: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            reference: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        if self.reference.is_some() {
            DetectorState::Ready
        } else {
            DetectorState::NoReference
        }
    }

    /// Forget the reference; the next frame only primes the detector.
    pub fn reset(&mut self) {
        self.reference = None;
    }

    /// Compare a frame with the previous one.
    ///
    /// Frames that cannot be decoded report no motion and leave the reference
    /// untouched.
    pub fn detect(&mut self, frame: &Frame) -> MotionResult {
        match decoder::to_luma(frame) {
            Ok(luma) => self.detect_luma(luma),
            Err(e) => {
                debug!(camera = frame.camera_id(), "Skipping undecodable frame: {}", e);
                MotionResult::default()
            }
        }
    }

    pub fn detect_luma(&mut self, luma: GrayImage) -> MotionResult {
        let current = if self.config.blur_sigma > 0.0 {
            imageops::blur(&luma, self.config.blur_sigma)
        } else {
            luma
        };

        let reference = match self.reference.take() {
            Some(reference) if reference.dimensions() == current.dimensions() => reference,
            _ => {
                // First frame, or the resolution changed under us
                self.reference = Some(current);
                return MotionResult::default();
            }
        };

        let (width, height) = current.dimensions();
        let mut mask: Vec<u8> = reference
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .map(|(&a, &b)| u8::from(a.abs_diff(b) > self.config.sensitivity))
            .collect();

        for _ in 0..self.config.dilate_iterations {
            mask = dilate(&mask, width as usize, height as usize);
        }

        self.reference = Some(current);

        match largest_component(&mask, width as usize, height as usize) {
            Some((area, region)) if area > self.config.min_area => MotionResult {
                is_motion: true,
                region: Some(region),
                area,
            },
            Some((area, _)) => MotionResult {
                area,
                ..MotionResult::default()
            },
            None => MotionResult::default(),
        }
    }
}

/// Binary dilation with a 5x5 square, done as two separable max passes.
fn dilate(mask: &[u8], width: usize, height: usize) -> Vec<u8> {
    const RADIUS: usize = 2;

    let mut horizontal = vec![0u8; mask.len()];
    for y in 0..height {
        let row = &mask[y * width..(y + 1) * width];
        let out = &mut horizontal[y * width..(y + 1) * width];
        for x in 0..width {
            let lo = x.saturating_sub(RADIUS);
            let hi = (x + RADIUS).min(width - 1);
            out[x] = u8::from(row[lo..=hi].iter().any(|&v| v != 0));
        }
    }

    let mut out = vec![0u8; mask.len()];
    for y in 0..height {
        let lo = y.saturating_sub(RADIUS);
        let hi = (y + RADIUS).min(height - 1);
        for x in 0..width {
            out[y * width + x] = u8::from((lo..=hi).any(|yy| horizontal[yy * width + x] != 0));
        }
    }
    out
}

/// Pixel area and bounding box of the largest 8-connected set region.
fn largest_component(mask: &[u8], width: usize, height: usize) -> Option<(u32, Rect)> {
    let mut visited = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut best: Option<(u32, Rect)> = None;

    for start in 0..mask.len() {
        if mask[start] == 0 || visited[start] {
            continue;
        }

        visited[start] = true;
        stack.push(start);
        let mut area = 0u32;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            area += 1;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let n = ny * width + nx;
                    if mask[n] != 0 && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        if best.map_or(true, |(best_area, _)| area > best_area) {
            best = Some((
                area,
                Rect {
                    x: min_x as u32,
                    y: min_y as u32,
                    width: (max_x - min_x + 1) as u32,
                    height: (max_y - min_y + 1) as u32,
                },
            ));
        }
    }

    best
}
