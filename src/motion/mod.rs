pub mod detector;
pub mod event;

pub use detector::{DetectorState, MotionDetector, MotionResult, Rect};
pub use event::{MotionEvent, MotionTracker, TrackerUpdate};
