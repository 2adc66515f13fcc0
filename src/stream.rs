//! Live JPEG feed fan-out.
//!
//! Each subscriber gets its own bounded flume channel. Publishing never
//! blocks: a subscriber whose queue is full misses the frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::capture::{decoder, Frame};

/// Content type for an HTTP response carrying [`multipart_chunk`]s
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Wrap one JPEG as a `multipart/x-mixed-replace` part.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    let mut buf = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    buf.put_slice(HEAD);
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub struct LiveFeed {
    camera_id: String,
    jpeg_quality: u8,
    subscribers: Mutex<Vec<Sender<Bytes>>>,
    closed: AtomicBool,
    stats: CachePadded<FeedStats>,
}

#[derive(Default)]
struct FeedStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

impl LiveFeed {
    pub fn new(camera_id: impl Into<String>, jpeg_quality: u8) -> Self {
        Self {
            camera_id: camera_id.into(),
            jpeg_quality,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stats: CachePadded::new(FeedStats::default()),
        }
    }

    /// Receive JPEG frames from now on. Dropping the receiver unsubscribes;
    /// subscribing to a closed feed yields an already finished receiver.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Bytes> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let mut subscribers = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return rx;
        }
        subscribers.push(tx);
        debug!(camera = %self.camera_id, "Live subscriber added");
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Encode and hand the frame to every subscriber. Frames nobody is
    /// watching are not encoded.
    pub fn publish(&self, frame: &Frame) {
        let mut subscribers = self.lock();
        if subscribers.is_empty() {
            return;
        }

        let jpeg = match decoder::encode_jpeg(frame, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                debug!(camera = %self.camera_id, "Live frame not encoded: {}", e);
                return;
            }
        };

        subscribers.retain(|tx| match tx.try_send(jpeg.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(camera = %self.camera_id, "Live subscriber lagging");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("argus_live_dropped_total", "camera" => self.camera_id.clone())
                    .increment(1);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(camera = %self.camera_id, "Live subscriber gone");
                false
            }
        });
        self.stats.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every subscriber; their receivers see the feed end.
    pub fn close(&self) {
        let mut subscribers = self.lock();
        self.closed.store(true, Ordering::Release);
        subscribers.clear();
    }

    /// (frames published, frames dropped for lagging subscribers)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.published.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Bytes>>> {
        // A panic while holding the lock leaves the list itself intact
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
