//! Pixel format conversion: raw camera buffers to RGB, luma, or JPEG.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::{Frame, PixelFormat};

/// Decode any supported frame into packed RGB.
pub fn decode_rgb(frame: &Frame) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);

    match frame.format() {
        PixelFormat::Mjpeg => return decode_jpeg_rgb(&frame.data),
        PixelFormat::Rgb24 => {
            for row in rows(frame, 3)? {
                rgb.extend_from_slice(row);
            }
        }
        PixelFormat::Bgr24 => {
            for row in rows(frame, 3)? {
                for px in row.chunks_exact(3) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
        PixelFormat::Gray8 => {
            for row in rows(frame, 1)? {
                for &y in row {
                    rgb.extend_from_slice(&[y, y, y]);
                }
            }
        }
        PixelFormat::Yuyv4 => {
            for row in rows(frame, 2)? {
                for quad in row.chunks_exact(4) {
                    let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                    rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                    rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
                }
            }
        }
        PixelFormat::Nv12 => {
            let stride = frame.meta.stride.max(width) as usize;
            let luma_len = stride * height as usize;
            let chroma_len = stride * height.div_ceil(2) as usize;
            if frame.data.len() < luma_len + chroma_len {
                return Err(eyre!(
                    "NV12 frame too short: {} bytes for {}x{}",
                    frame.data.len(),
                    width,
                    height
                ));
            }
            let (luma, chroma) = frame.data.split_at(luma_len);
            for y in 0..height as usize {
                let uv_row = &chroma[(y / 2) * stride..];
                for x in 0..width as usize {
                    let luma_px = luma[y * stride + x];
                    let uv = (x / 2) * 2;
                    rgb.extend_from_slice(&yuv_to_rgb(luma_px, uv_row[uv], uv_row[uv + 1]));
                }
            }
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| eyre!("decoded buffer does not match {}x{}", width, height))
}

/// Extract single-channel intensity, avoiding a full RGB conversion where the
/// format already carries a luma plane.
pub fn to_luma(frame: &Frame) -> Result<GrayImage> {
    let (width, height) = (frame.width(), frame.height());
    let mut luma = Vec::with_capacity((width * height) as usize);

    match frame.format() {
        PixelFormat::Gray8 | PixelFormat::Nv12 => {
            for row in rows(frame, 1)? {
                luma.extend_from_slice(row);
            }
        }
        PixelFormat::Yuyv4 => {
            for row in rows(frame, 2)? {
                luma.extend(row.iter().step_by(2));
            }
        }
        PixelFormat::Rgb24 => {
            for row in rows(frame, 3)? {
                luma.extend(row.chunks_exact(3).map(|p| rgb_luma(p[0], p[1], p[2])));
            }
        }
        PixelFormat::Bgr24 => {
            for row in rows(frame, 3)? {
                luma.extend(row.chunks_exact(3).map(|p| rgb_luma(p[2], p[1], p[0])));
            }
        }
        PixelFormat::Mjpeg => {
            let rgb = decode_jpeg_rgb(&frame.data)?;
            let (w, h) = rgb.dimensions();
            let gray = rgb.pixels().map(|p| rgb_luma(p[0], p[1], p[2])).collect();
            return GrayImage::from_raw(w, h, gray)
                .ok_or_else(|| eyre!("decoded JPEG does not match {}x{}", w, h));
        }
    }

    GrayImage::from_raw(width, height, luma)
        .ok_or_else(|| eyre!("luma buffer does not match {}x{}", width, height))
}

/// JPEG bytes for a frame. MJPEG frames pass through untouched.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes> {
    if frame.format() == PixelFormat::Mjpeg {
        return Ok(frame.data.clone());
    }

    let rgb = decode_rgb(frame)?;
    let mut out = Vec::with_capacity(rgb.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&rgb)?;
    Ok(Bytes::from(out))
}

fn decode_jpeg_rgb(data: &[u8]) -> Result<RgbImage> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| eyre!("JPEG decoder returned no image info"))?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&y| [y, y, y]).collect(),
        JpegPixelFormat::L16 => pixels
            .chunks_exact(2)
            .flat_map(|px| [px[0], px[0], px[0]])
            .collect(),
        JpegPixelFormat::CMYK32 => pixels
            .chunks_exact(4)
            .flat_map(|px| {
                let k = u16::from(px[3]);
                let channel = |c: u8| ((u16::from(c) * k) / 255) as u8;
                [channel(px[0]), channel(px[1]), channel(px[2])]
            })
            .collect(),
    };

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| eyre!("JPEG payload does not match {}x{}", width, height))
}

/// Row slices of the first plane, `width * bpp` bytes each.
fn rows(frame: &Frame, bpp: u32) -> Result<impl Iterator<Item = &[u8]>> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let row_len = width * bpp as usize;
    let stride = (frame.meta.stride as usize).max(row_len);
    let needed = stride * height.saturating_sub(1) + row_len;
    if height > 0 && frame.data.len() < needed {
        return Err(eyre!(
            "{:?} frame too short: {} bytes for {}x{}",
            frame.format(),
            frame.data.len(),
            width,
            height
        ));
    }
    Ok((0..height).map(move |y| &frame.data[y * stride..y * stride + row_len]))
}

#[inline]
fn rgb_luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b) + 128) >> 8) as u8
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Frame {
        Frame::new(Arc::from("cam"), 0, width, height, format, Bytes::from(data))
    }

    #[test]
    fn test_rgb_luma_extremes() {
        assert_eq!(rgb_luma(0, 0, 0), 0);
        assert_eq!(rgb_luma(255, 255, 255), 255);
    }

    #[test]
    fn test_yuyv_luma_takes_even_bytes() {
        // Two pixels per quad: Y0 U Y1 V
        let f = frame(PixelFormat::Yuyv4, 2, 1, vec![10, 128, 200, 128]);
        let luma = to_luma(&f).unwrap();
        assert_eq!(luma.as_raw(), &vec![10, 200]);
    }

    #[test]
    fn test_bgr_matches_rgb() {
        let rgb = frame(PixelFormat::Rgb24, 1, 1, vec![200, 50, 10]);
        let bgr = frame(PixelFormat::Bgr24, 1, 1, vec![10, 50, 200]);
        assert_eq!(to_luma(&rgb).unwrap(), to_luma(&bgr).unwrap());
        assert_eq!(decode_rgb(&bgr).unwrap().as_raw(), &vec![200, 50, 10]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let f = frame(PixelFormat::Rgb24, 4, 4, vec![0; 10]);
        assert!(to_luma(&f).is_err());
        assert!(decode_rgb(&f).is_err());
    }

    #[test]
    fn test_jpeg_roundtrip_dimensions() {
        let f = frame(PixelFormat::Gray8, 16, 8, vec![128; 16 * 8]);
        let jpeg = encode_jpeg(&f, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = frame(PixelFormat::Mjpeg, 16, 8, jpeg.to_vec());
        let luma = to_luma(&decoded).unwrap();
        assert_eq!(luma.dimensions(), (16, 8));
        assert!(luma.pixels().all(|p| (p[0] as i32 - 128).abs() < 8));
    }

    #[test]
    fn test_mjpeg_passthrough() {
        let data = vec![0xFF, 0xD8, 0xFF, 0xD9];
        let f = frame(PixelFormat::Mjpeg, 1, 1, data.clone());
        assert_eq!(encode_jpeg(&f, 50).unwrap().to_vec(), data);
    }
}
