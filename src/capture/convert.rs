//! Color conversion of low-resolution capture frames to packed RGB

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::{Error, Result};

/// Convert a frame of any supported format into tightly packed RGB24.
pub fn to_rgb(frame: &Frame) -> Result<Vec<u8>> {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let expected = frame.format().frame_len(frame.width(), frame.height());
    if frame.data.len() < expected {
        return Err(Error::transcode(format!(
            "{:?} frame {}x{} needs {} bytes, got {}",
            frame.format(),
            width,
            height,
            expected,
            frame.data.len()
        )));
    }

    let data = &frame.data[..];
    let rgb = match frame.format() {
        PixelFormat::Rgb24 => data[..expected].to_vec(),
        PixelFormat::Bgr24 => data[..expected]
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::I420 => {
            let luma = width * height;
            let chroma = width.div_ceil(2) * height.div_ceil(2);
            let (y, rest) = data.split_at(luma);
            let (u, v) = rest.split_at(chroma);
            planar_to_rgb(width, height, y, |idx| (u[idx], v[idx]))
        }
        PixelFormat::Nv12 => {
            let luma = width * height;
            let (y, uv) = data.split_at(luma);
            planar_to_rgb(width, height, y, |idx| (uv[idx * 2], uv[idx * 2 + 1]))
        }
        PixelFormat::Yuyv => yuyv_to_rgb(width, height, data),
    };

    Ok(rgb)
}

fn planar_to_rgb(
    width: usize,
    height: usize,
    y: &[u8],
    chroma_at: impl Fn(usize) -> (u8, u8),
) -> Vec<u8> {
    let chroma_width = width.div_ceil(2);
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let (u, v) = chroma_at((row / 2) * chroma_width + col / 2);
            rgb.extend_from_slice(&yuv_to_rgb(y[row * width + col], u, v));
        }
    }
    rgb
}

fn yuyv_to_rgb(width: usize, height: usize, data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        let line = &data[row * width * 2..(row + 1) * width * 2];
        for (pair, px) in line.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
            rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
            if pair * 2 + 1 < width {
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
        }
    }
    rgb
}

/// BT.601 limited range, fixed point.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

/// Inverse of [`yuv_to_rgb`], used by sources that synthesize YUV frames.
#[inline]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    [y as u8, u.clamp(0, 255) as u8, v.clamp(0, 255) as u8]
}
