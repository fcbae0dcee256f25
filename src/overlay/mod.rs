//! Timestamp overlay burned into every recorded frame
//!
//! The text is drawn twice from the same bitmap glyphs: first dilated by the
//! outline stroke in the outline color, then by the thinner text stroke in the
//! text color. Rendering touches only pixels inside [`OverlayStamper::bounding_box`]
//! and never allocates.

pub mod glyphs;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, Timelike};

use crate::capture::frame::{FrameMut, PixelFormat};
use crate::capture::source::PreFrameHook;
use crate::overlay::glyphs::{glyph, lit_dots, GLYPH_ADVANCE, GLYPH_HEIGHT};
use crate::OverlayConfig;

/// Dots per glyph dot at `font_scale == 1.0`.
const BASE_DOT_SIZE: f32 = 4.0;

/// Length of `DD.MM.YYYY HH:MM:SS`.
pub const TIMESTAMP_LEN: usize = 19;

/// Axis-aligned pixel rectangle, half-open on the right and bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// Stack-allocated timestamp text.
#[derive(Clone, Copy)]
pub struct TimestampText([u8; TIMESTAMP_LEN]);

impl TimestampText {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII digits and separators are ever written.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

/// Format `time` as `DD.MM.YYYY HH:MM:SS` without allocating.
pub fn format_timestamp(time: &DateTime<Local>) -> TimestampText {
    fn put(buf: &mut [u8], value: u32) {
        let mut v = value;
        for slot in buf.iter_mut().rev() {
            *slot = b'0' + (v % 10) as u8;
            v /= 10;
        }
    }

    let mut out = *b"00.00.0000 00:00:00";
    put(&mut out[0..2], time.day());
    put(&mut out[3..5], time.month());
    put(&mut out[6..10], time.year().clamp(0, 9999) as u32);
    put(&mut out[11..13], time.hour());
    put(&mut out[14..16], time.minute());
    put(&mut out[17..19], time.second());
    TimestampText(out)
}

/// Renders the wall-clock time onto full-resolution frames.
#[derive(Debug, Clone)]
pub struct OverlayStamper {
    config: OverlayConfig,
    dot: u32,
}

impl OverlayStamper {
    pub fn new(config: OverlayConfig) -> Self {
        // Float to int casts saturate, so absurd scales land on u32::MAX.
        let dot = (config.font_scale * BASE_DOT_SIZE).round().max(1.0) as u32;
        Self { config, dot }
    }

    /// Wrap the stamper as a pre-frame hook that stamps the current local time.
    pub fn into_hook(self) -> PreFrameHook {
        Arc::new(move |frame: &mut FrameMut<'_>| self.stamp_now(frame))
    }

    pub fn stamp_now(&self, frame: &mut FrameMut<'_>) {
        let text = format_timestamp(&Local::now());
        self.stamp(frame, text.as_bytes());
    }

    /// Draw `text` anchored bottom-right of `frame`.
    pub fn stamp(&self, frame: &mut FrameMut<'_>, text: &[u8]) {
        let (x0, y0) = self.origin(frame.width, frame.height, text.len());
        let outline = self.outline_radius();
        let fill = self.config.thickness / 2;

        self.draw_text(frame, text, x0, y0, outline, self.config.outline_color);
        self.draw_text(frame, text, x0, y0, fill as i64, self.config.text_color);
    }

    /// Pixel size of the undilated text block.
    pub fn text_size(&self, chars: usize) -> (u32, u32) {
        if chars == 0 {
            return (0, 0);
        }
        let columns = u32::try_from(chars)
            .unwrap_or(u32::MAX)
            .saturating_mul(GLYPH_ADVANCE)
            .saturating_sub(1);
        (
            columns.saturating_mul(self.dot),
            GLYPH_HEIGHT.saturating_mul(self.dot),
        )
    }

    fn outline_radius(&self) -> i64 {
        (self.config.thickness as i64 + self.config.outline_thickness as i64) / 2
    }

    /// Region a `chars`-long text can touch on a `width`x`height` frame,
    /// clipped to the frame.
    pub fn bounding_box(&self, width: u32, height: u32, chars: usize) -> Rect {
        let (x0, y0) = self.origin(width, height, chars);
        let (tw, th) = self.text_size(chars);
        let pad = self.outline_radius();

        let left = (x0 - pad).clamp(0, width as i64);
        let top = (y0 - pad).clamp(0, height as i64);
        let right = (x0 + tw as i64 + pad).clamp(0, width as i64);
        let bottom = (y0 + th as i64 + pad).clamp(0, height as i64);
        Rect {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        }
    }

    fn origin(&self, width: u32, height: u32, chars: usize) -> (i64, i64) {
        let (tw, th) = self.text_size(chars);
        let margin = self.config.margin as i64;
        (
            width as i64 - margin - tw as i64,
            height as i64 - margin - th as i64,
        )
    }

    fn draw_text(
        &self,
        frame: &mut FrameMut<'_>,
        text: &[u8],
        x0: i64,
        y0: i64,
        radius: i64,
        color: [u8; 3],
    ) {
        let dot = self.dot as i64;
        let advance = (GLYPH_ADVANCE as i64).saturating_mul(dot);
        let size = dot.saturating_add(radius.saturating_mul(2));
        for (i, &ch) in text.iter().enumerate() {
            let gx = x0.saturating_add((i as i64).saturating_mul(advance));
            for (col, row) in lit_dots(glyph(ch)) {
                let left = gx.saturating_add(col as i64 * dot).saturating_sub(radius);
                let top = y0.saturating_add(row as i64 * dot).saturating_sub(radius);
                fill_rect(frame, left, top, size, size, color);
            }
        }
    }
}

fn fill_rect(frame: &mut FrameMut<'_>, left: i64, top: i64, w: i64, h: i64, color: [u8; 3]) {
    let x_start = left.max(0);
    let y_start = top.max(0);
    let x_end = left.saturating_add(w).min(frame.width as i64);
    let y_end = top.saturating_add(h).min(frame.height as i64);
    if x_start >= x_end || y_start >= y_end {
        return;
    }

    let [r, g, b] = color;
    let luma = crate::capture::convert::rgb_to_yuv(r, g, b)[0];
    let stride = frame.stride as usize;

    for y in y_start as usize..y_end as usize {
        let row = y * stride;
        for x in x_start as usize..x_end as usize {
            match frame.format {
                PixelFormat::Rgb24 => put(frame.data, row + x * 3, &[r, g, b]),
                PixelFormat::Bgr24 => put(frame.data, row + x * 3, &[b, g, r]),
                PixelFormat::Yuyv => put(frame.data, row + x * 2, &[luma]),
                PixelFormat::Nv12 | PixelFormat::I420 => put(frame.data, row + x, &[luma]),
            }
        }
    }
}

#[inline]
fn put(data: &mut [u8], offset: usize, px: &[u8]) {
    if let Some(dst) = data.get_mut(offset..offset + px.len()) {
        dst.copy_from_slice(px);
    }
}
