//! GStreamer clip muxing: `appsrc ! jpegparse ! avimux ! filesink`.
//!
//! Frames are JPEG-encoded here and pushed with timestamps relative to the
//! clip's first frame; `avimux` writes the index and header on EOS.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, instrument, warn};

use super::{ClipSink, SinkFactory};
use crate::capture::{decoder, Frame};

const ELEMENTS: [&str; 4] = ["appsrc", "jpegparse", "avimux", "filesink"];
/// Longest wait for the muxer to drain after EOS
const EOS_TIMEOUT: u64 = 5;

/// Creates [`GstClipWriter`]s. Construction checks that GStreamer and the
/// required plugins are present.
#[derive(Debug, Clone, Copy)]
pub struct GstSinkFactory {
    jpeg_quality: u8,
}

impl GstSinkFactory {
    pub fn new(jpeg_quality: u8) -> Result<Self> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;
        if let Some(missing) = ELEMENTS
            .iter()
            .find(|name| gst::ElementFactory::find(name).is_none())
        {
            return Err(eyre!("GStreamer element '{}' is not installed", missing));
        }
        info!("Muxing clips with GStreamer avimux");
        Ok(Self { jpeg_quality })
    }
}

impl SinkFactory for GstSinkFactory {
    fn create(
        &self,
        path: &Path,
        first: &Frame,
        nominal_period: Duration,
    ) -> io::Result<Box<dyn ClipSink>> {
        let writer = GstClipWriter::create(path, first, nominal_period, self.jpeg_quality)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(Box::new(writer))
    }
}

pub struct GstClipWriter {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    path: PathBuf,
    width: u32,
    height: u32,
    quality: u8,
    nominal_period: Duration,
    /// Timestamp of the first frame; PTS zero
    start: Instant,
    frames: u64,
}

impl GstClipWriter {
    #[instrument(skip(first, nominal_period, quality))]
    pub fn create(
        path: &Path,
        first: &Frame,
        nominal_period: Duration,
        quality: u8,
    ) -> Result<Self> {
        // filesink truncates; keep the same no-overwrite rule as the plain writer
        File::options().write(true).create_new(true).open(path)?;

        let fps = (1.0 / nominal_period.as_secs_f64().max(1e-3)).round().max(1.0) as i32;
        let caps = gst::Caps::builder("image/jpeg")
            .field("width", first.width() as i32)
            .field("height", first.height() as i32)
            .field("framerate", gst::Fraction::new(fps, 1))
            .build();

        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&caps)
            .format(gst::Format::Time)
            .block(true)
            .build();
        let parser = gst::ElementFactory::make("jpegparse")
            .build()
            .map_err(|e| eyre!("Failed to create jpegparse: {}", e))?;
        let muxer = gst::ElementFactory::make("avimux")
            .build()
            .map_err(|e| eyre!("Failed to create avimux: {}", e))?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|e| eyre!("Failed to create filesink: {}", e))?;

        let pipeline = gst::Pipeline::new();
        let elements = [appsrc.upcast_ref::<gst::Element>(), &parser, &muxer, &filesink];
        pipeline
            .add_many(elements)
            .map_err(|e| eyre!("Failed to add elements: {}", e))?;
        gst::Element::link_many(elements).map_err(|e| eyre!("Failed to link elements: {}", e))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start clip pipeline: {}", e))?;

        debug!("Clip pipeline playing at {} fps", fps);
        Ok(Self {
            pipeline,
            appsrc,
            path: path.to_path_buf(),
            width: first.width(),
            height: first.height(),
            quality,
            nominal_period,
            start: first.timestamp,
            frames: 0,
        })
    }

    /// Surface an error the pipeline posted since the last check.
    fn check_bus(&self) -> io::Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        match bus.pop_filtered(&[gst::MessageType::Error]) {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => Err(pipeline_error(&err.error().to_string())),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }
}

impl ClipSink for GstClipWriter {
    fn append(&mut self, frame: &Frame) -> io::Result<()> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame is {}x{}, clip is {}x{}",
                    frame.width(),
                    frame.height(),
                    self.width,
                    self.height
                ),
            ));
        }
        self.check_bus()?;

        let jpeg = decoder::encode_jpeg(frame, self.quality)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let pts = frame.timestamp.saturating_duration_since(self.start);

        let mut buffer = gst::Buffer::from_slice(jpeg);
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
            buffer.set_duration(gst::ClockTime::from_nseconds(
                self.nominal_period.as_nanos() as u64,
            ));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| pipeline_error(&format!("push failed: {:?}", e)))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>, _span: Duration) -> io::Result<u64> {
        if let Err(e) = self.appsrc.end_of_stream() {
            warn!("Failed to send EOS: {:?}", e);
        }

        let mut failure = None;
        if let Some(bus) = self.pipeline.bus() {
            for msg in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT)) {
                match msg.view() {
                    gst::MessageView::Eos(..) => break,
                    gst::MessageView::Error(err) => {
                        failure = Some(pipeline_error(&format!(
                            "{} ({:?})",
                            err.error(),
                            err.debug()
                        )));
                        break;
                    }
                    _ => {}
                }
            }
        }
        // Null flushes and closes the filesink
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop clip pipeline: {}", e);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let file = File::open(&self.path)?;
        file.sync_all()?;
        let size = file.metadata()?.len();
        debug!(
            "Closed {} with {} frames ({} bytes)",
            self.path.display(),
            self.frames,
            size
        );
        Ok(size)
    }
}

impl Drop for GstClipWriter {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn pipeline_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("clip pipeline: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn frame(base: Instant, index: u32, level: u8) -> Frame {
        Frame::new(
            Arc::from("cam"),
            u64::from(index),
            32,
            32,
            PixelFormat::Gray8,
            Bytes::from(vec![level; 32 * 32]),
        )
        .with_timestamps(base + Duration::from_millis(100) * index, chrono::Local::now())
    }

    #[test]
    fn test_avimux_clip() {
        let Ok(factory) = GstSinkFactory::new(80) else {
            // Plugins missing on this machine
            return;
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let base = Instant::now();

        let mut sink = factory
            .create(&path, &frame(base, 0, 0), Duration::from_millis(100))
            .unwrap();
        for i in 0..5 {
            sink.append(&frame(base, i, (i * 40) as u8)).unwrap();
        }
        assert!(sink.append(&Frame::new(
            Arc::from("cam"),
            9,
            16,
            16,
            PixelFormat::Gray8,
            Bytes::from(vec![0; 256]),
        ))
        .is_err());
        let size = sink.finish(Duration::from_millis(500)).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, size);
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"AVI ");
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let Ok(factory) = GstSinkFactory::new(80) else {
            return;
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        std::fs::write(&path, b"existing").unwrap();
        assert!(factory
            .create(&path, &frame(Instant::now(), 0, 0), Duration::from_millis(100))
            .is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"existing");
    }
}
