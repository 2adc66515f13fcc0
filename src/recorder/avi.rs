//! Incremental MJPEG-in-AVI writer.
//!
//! Layout: a fixed 224 byte header (`RIFF`/`hdrl`/`strl`/`movi` list heads),
//! one `00dc` chunk per frame, then an `idx1` index. Counts and timing in the
//! header are placeholders until `finish` rewrites it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument};

use super::{ClipSink, SinkFactory};
use crate::capture::{decoder, Frame};

const HEADER_LEN: u32 = 224;
/// Offset of the `movi` fourcc; index offsets are relative to it
const MOVI_FOURCC_POS: u32 = 220;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

/// Creates [`AviWriter`]s encoding raw frames at a fixed JPEG quality.
#[derive(Debug, Clone, Copy)]
pub struct AviSinkFactory {
    pub jpeg_quality: u8,
}

impl SinkFactory for AviSinkFactory {
    fn create(
        &self,
        path: &Path,
        first: &Frame,
        nominal_period: Duration,
    ) -> io::Result<Box<dyn ClipSink>> {
        let writer = AviWriter::create(
            path,
            first.width(),
            first.height(),
            nominal_period,
            self.jpeg_quality,
        )?;
        Ok(Box::new(writer))
    }
}

pub struct AviWriter {
    file: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    quality: u8,
    nominal_period: Duration,
    /// (offset from the `movi` fourcc, payload size) per frame
    index: Vec<(u32, u32)>,
    position: u32,
    largest_chunk: u32,
}

#[derive(Debug, Clone, Copy)]
struct HeaderFields {
    width: u32,
    height: u32,
    frames: u32,
    micros_per_frame: u32,
    largest_chunk: u32,
    riff_size: u32,
    movi_size: u32,
}

impl AviWriter {
    #[instrument(skip(nominal_period, quality))]
    pub fn create(
        path: &Path,
        width: u32,
        height: u32,
        nominal_period: Duration,
        quality: u8,
    ) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut file = BufWriter::new(file);

        let fields = HeaderFields {
            width,
            height,
            frames: 0,
            micros_per_frame: micros(nominal_period),
            largest_chunk: 0,
            riff_size: HEADER_LEN - 8,
            movi_size: 4,
        };
        file.write_all(&header(&fields))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            width,
            height,
            quality,
            nominal_period,
            index: Vec::new(),
            position: HEADER_LEN,
            largest_chunk: 0,
        })
    }

    fn write_chunk(&mut self, fourcc: &[u8; 4], payload: &[u8]) -> io::Result<()> {
        let size = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk exceeds 4 GiB"))?;
        let padded = size + (size & 1);
        let next = self
            .position
            .checked_add(8 + padded)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "AVI file exceeds 4 GiB"))?;

        self.file.write_all(fourcc)?;
        self.file.write_all(&size.to_le_bytes())?;
        self.file.write_all(payload)?;
        if size & 1 == 1 {
            self.file.write_all(&[0])?;
        }

        self.index.push((self.position - MOVI_FOURCC_POS, size));
        self.largest_chunk = self.largest_chunk.max(size);
        self.position = next;
        Ok(())
    }
}

impl ClipSink for AviWriter {
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

        let jpeg = decoder::encode_jpeg(frame, self.quality)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.write_chunk(b"00dc", &jpeg)
    }

    fn finish(mut self: Box<Self>, span: Duration) -> io::Result<u64> {
        let frames = self.index.len() as u32;
        let movi_end = self.position;

        let mut idx1 = Vec::with_capacity(self.index.len() * 16);
        for &(offset, size) in &self.index {
            idx1.extend_from_slice(b"00dc");
            idx1.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx1.extend_from_slice(&offset.to_le_bytes());
            idx1.extend_from_slice(&size.to_le_bytes());
        }
        self.file.write_all(b"idx1")?;
        self.file.write_all(&(idx1.len() as u32).to_le_bytes())?;
        self.file.write_all(&idx1)?;
        let file_len = movi_end + 8 + idx1.len() as u32;

        let period = if frames > 0 && !span.is_zero() {
            span / frames
        } else {
            self.nominal_period
        };
        let fields = HeaderFields {
            width: self.width,
            height: self.height,
            frames,
            micros_per_frame: micros(period),
            largest_chunk: self.largest_chunk,
            riff_size: file_len - 8,
            movi_size: movi_end - MOVI_FOURCC_POS,
        };

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header(&fields))?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        debug!(
            "Closed {} with {} frames ({} bytes)",
            self.path.display(),
            frames,
            file_len
        );
        Ok(u64::from(file_len))
    }
}

fn micros(period: Duration) -> u32 {
    u32::try_from(period.as_micros()).unwrap_or(u32::MAX).max(1)
}

fn header(f: &HeaderFields) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    let mut put = |bytes: &[u8]| h.extend_from_slice(bytes);
    let le = |v: u32| v.to_le_bytes();
    let fps_bytes = f
        .largest_chunk
        .saturating_mul(1_000_000 / f.micros_per_frame.max(1));

    put(b"RIFF");
    put(&le(f.riff_size));
    put(b"AVI ");

    put(b"LIST");
    put(&le(192));
    put(b"hdrl");

    // MainAVIHeader
    put(b"avih");
    put(&le(56));
    put(&le(f.micros_per_frame));
    put(&le(fps_bytes)); // dwMaxBytesPerSec
    put(&le(0)); // dwPaddingGranularity
    put(&le(AVIF_HASINDEX));
    put(&le(f.frames));
    put(&le(0)); // dwInitialFrames
    put(&le(1)); // dwStreams
    put(&le(f.largest_chunk));
    put(&le(f.width));
    put(&le(f.height));
    put(&[0; 16]);

    put(b"LIST");
    put(&le(116));
    put(b"strl");

    // AVIStreamHeader, rate/scale expressed in microseconds
    put(b"strh");
    put(&le(56));
    put(b"vids");
    put(b"MJPG");
    put(&le(0)); // dwFlags
    put(&[0; 4]); // wPriority, wLanguage
    put(&le(0)); // dwInitialFrames
    put(&le(f.micros_per_frame)); // dwScale
    put(&le(1_000_000)); // dwRate
    put(&le(0)); // dwStart
    put(&le(f.frames)); // dwLength
    put(&le(f.largest_chunk));
    put(&le(u32::MAX)); // dwQuality: default
    put(&le(0)); // dwSampleSize
    put(&0u16.to_le_bytes());
    put(&0u16.to_le_bytes());
    put(&(f.width.min(u16::MAX as u32) as u16).to_le_bytes());
    put(&(f.height.min(u16::MAX as u32) as u16).to_le_bytes());

    // BITMAPINFOHEADER
    put(b"strf");
    put(&le(40));
    put(&le(40));
    put(&le(f.width));
    put(&le(f.height));
    put(&1u16.to_le_bytes()); // biPlanes
    put(&24u16.to_le_bytes()); // biBitCount
    put(b"MJPG");
    put(&le(f.width * f.height * 3));
    put(&[0; 16]); // resolution and palette fields

    put(b"LIST");
    put(&le(f.movi_size));
    put(b"movi");

    debug_assert_eq!(h.len(), HEADER_LEN as usize);
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn read_u32(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    fn gray_frame(level: u8) -> Frame {
        Frame::new(
            Arc::from("cam"),
            0,
            16,
            16,
            PixelFormat::Gray8,
            Bytes::from(vec![level; 256]),
        )
    }

    #[test]
    fn test_header_layout() {
        let fields = HeaderFields {
            width: 640,
            height: 480,
            frames: 7,
            micros_per_frame: 100_000,
            largest_chunk: 1234,
            riff_size: 999,
            movi_size: 55,
        };
        let h = header(&fields);
        assert_eq!(h.len(), HEADER_LEN as usize);
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(&h[24..28], b"avih");
        assert_eq!(read_u32(&h, 48), 7);
        assert_eq!(&h[100..104], b"strh");
        assert_eq!(read_u32(&h, 140), 7);
        assert_eq!(&h[164..168], b"strf");
        assert_eq!(read_u32(&h, 216), 55);
        assert_eq!(&h[MOVI_FOURCC_POS as usize..HEADER_LEN as usize], b"movi");
    }

    #[test]
    fn test_written_file_is_consistent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer = Box::new(
            AviWriter::create(&path, 16, 16, Duration::from_millis(100), 80).unwrap(),
        );
        for level in [0, 64, 128] {
            writer.append(&gray_frame(level)).unwrap();
        }
        let len = writer.finish(Duration::from_millis(300)).unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, len);
        assert_eq!(read_u32(&data, 4) as usize, data.len() - 8);
        assert_eq!(read_u32(&data, 48), 3);
        assert_eq!(read_u32(&data, 32), 100_000);

        // First chunk follows the header and holds a JPEG
        assert_eq!(&data[224..228], b"00dc");
        assert_eq!(&data[232..234], &[0xFF, 0xD8]);

        // Index sits right after the movi list
        let movi_end = MOVI_FOURCC_POS as usize + read_u32(&data, 216) as usize;
        assert_eq!(&data[movi_end..movi_end + 4], b"idx1");
        assert_eq!(read_u32(&data, movi_end + 4), 3 * 16);
        assert_eq!(read_u32(&data, movi_end + 16), 4);
    }

    #[test]
    fn test_rejects_size_change() {
        let dir = tempdir().unwrap();
        let mut writer =
            AviWriter::create(&dir.path().join("c.avi"), 8, 8, Duration::from_millis(33), 80)
                .unwrap();
        assert!(writer.append(&gray_frame(10)).is_err());
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.avi");
        std::fs::write(&path, b"existing").unwrap();
        assert!(AviWriter::create(&path, 8, 8, Duration::from_millis(33), 80).is_err());
    }
}
