//! Monochrome dithering against a luminance threshold.
//!
//! Every algorithm writes `R = G = B` in `{0, 255}` and leaves alpha as is.
//! The per-range functions (`threshold_range`, `ordered_range`,
//! `halftone_rows`, `diffuse_rows`) are what the chunk scheduler drives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherType {
    #[serde(alias = "floydSteinberg", alias = "floyd-steinberg")]
    FloydSteinberg,
    Ordered,
    #[serde(alias = "bayer_2x2", alias = "bayer-2x2")]
    Bayer2x2,
    #[serde(alias = "bayer_4x4", alias = "bayer-4x4")]
    Bayer4x4,
    Halftone,
    #[serde(alias = "threshold")]
    None,
}

impl DitherType {
    pub const ALL: [DitherType; 6] = [
        DitherType::FloydSteinberg,
        DitherType::Ordered,
        DitherType::Bayer2x2,
        DitherType::Bayer4x4,
        DitherType::Halftone,
        DitherType::None,
    ];

    /// Stable name, also used in cache keys.
    pub fn as_str(self) -> &'static str {
        match self {
            DitherType::FloydSteinberg => "floyd_steinberg",
            DitherType::Ordered => "ordered",
            DitherType::Bayer2x2 => "bayer2x2",
            DitherType::Bayer4x4 => "bayer4x4",
            DitherType::Halftone => "halftone",
            DitherType::None => "none",
        }
    }
}

impl fmt::Display for DitherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dither type '{0}'")]
pub struct UnknownDitherType(pub String);

impl FromStr for DitherType {
    type Err = UnknownDitherType;

    /// Case-insensitive; `-`, `_` and spaces are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "floydsteinberg" | "fs" => Ok(DitherType::FloydSteinberg),
            "ordered" => Ok(DitherType::Ordered),
            "bayer2x2" | "bayer2" => Ok(DitherType::Bayer2x2),
            "bayer4x4" | "bayer4" => Ok(DitherType::Bayer4x4),
            "halftone" => Ok(DitherType::Halftone),
            "none" | "threshold" => Ok(DitherType::None),
            _ => Err(UnknownDitherType(s.to_string())),
        }
    }
}

#[rustfmt::skip]
const BAYER_2: [[u8; 2]; 2] = [[0, 2], [3, 1]];
#[rustfmt::skip]
const BAYER_4: [[u8; 4]; 4] = [
    [ 0,  8,  2, 10],
    [12,  4, 14,  6],
    [ 3, 11,  1,  9],
    [15,  7, 13,  5],
];

/// Dot patterns for 2x2 halftone cells, positions TL, TR, BL, BR (1 = white).
#[rustfmt::skip]
const HALFTONE_PATTERNS: [[u8; 4]; 5] = [
    [0, 0, 0, 0],
    [1, 0, 0, 0],
    [1, 0, 0, 1],
    [1, 1, 0, 1],
    [1, 1, 1, 1],
];

/// Per-cell thresholds for an ordered matrix, already scaled by `threshold`.
#[derive(Debug, Clone)]
pub struct OrderedThresholds {
    n: usize,
    cells: Vec<f32>,
}

impl OrderedThresholds {
    pub fn new(kind: DitherType, threshold: f32) -> Option<Self> {
        let (n, values): (usize, Vec<u8>) = match kind {
            DitherType::Ordered | DitherType::Bayer4x4 => {
                (4, BAYER_4.iter().flatten().copied().collect())
            }
            DitherType::Bayer2x2 => (2, BAYER_2.iter().flatten().copied().collect()),
            _ => return None,
        };
        let step = 255.0 / (n * n) as f32;
        let gain = threshold / 128.0;
        let cells = values
            .into_iter()
            .map(|m| (m as f32 + 0.5) * step * gain)
            .collect();
        Some(Self { n, cells })
    }

    #[inline(always)]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.cells[(y % self.n) * self.n + (x % self.n)]
    }
}

#[inline(always)]
pub fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * (r as f32) + 0.587 * (g as f32) + 0.114 * (b as f32)
}

#[inline(always)]
fn write_mono(px: &mut [u8], white: bool) {
    let v = if white { 255 } else { 0 };
    px[0] = v;
    px[1] = v;
    px[2] = v;
}

/// Dither a full RGBA buffer in place, in one pass.
///
/// pixels: RGBA8 interleaved slice, length must be width * height * 4.
#[cfg(test)]
pub fn dither_image(pixels: &mut [u8], width: u32, height: u32, kind: DitherType, threshold: f32) {
    let (w, h) = (width as usize, height as usize);
    if pixels.is_empty() || w == 0 || h == 0 {
        return;
    }
    match kind {
        DitherType::None => threshold_range(pixels, threshold),
        DitherType::Ordered | DitherType::Bayer2x2 | DitherType::Bayer4x4 => {
            if let Some(cells) = OrderedThresholds::new(kind, threshold) {
                ordered_range(pixels, w, 0, &cells);
            }
        }
        DitherType::Halftone => halftone_rows(pixels, w, threshold),
        DitherType::FloydSteinberg => {
            let mut gray = grayscale(pixels);
            diffuse_rows(&mut gray, pixels, w, 0, threshold);
        }
    }
}

/// Plain threshold on luma. Any pixel-aligned range is valid.
pub fn threshold_range(pixels: &mut [u8], threshold: f32) {
    for px in pixels.chunks_exact_mut(4) {
        let l = luma(px[0], px[1], px[2]);
        write_mono(px, l >= threshold);
    }
}

/// Ordered (Bayer) dither over a pixel-aligned range.
///
/// `first_pixel` is the absolute index of the range's first pixel, so the
/// matrix stays anchored to image coordinates regardless of chunking.
pub fn ordered_range(
    pixels: &mut [u8],
    width: usize,
    first_pixel: usize,
    cells: &OrderedThresholds,
) {
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let idx = first_pixel + i;
        let (x, y) = (idx % width, idx / width);
        let l = luma(px[0], px[1], px[2]);
        write_mono(px, l >= cells.at(x, y));
    }
}

/// 2x2 block halftone over whole rows. The slice must start on an even image row.
pub fn halftone_rows(pixels: &mut [u8], width: usize, threshold: f32) {
    let rows = pixels.len() / 4 / width;
    let step = 255.0 / (4.0 * (threshold / 128.0));
    for by in (0..rows).step_by(2) {
        for bx in (0..width).step_by(2) {
            let cells = [(bx, by), (bx + 1, by), (bx, by + 1), (bx + 1, by + 1)];
            let mut sum = 0.0f32;
            let mut count = 0u32;
            for &(x, y) in &cells {
                if x < width && y < rows {
                    let i = (y * width + x) * 4;
                    sum += luma(pixels[i], pixels[i + 1], pixels[i + 2]);
                    count += 1;
                }
            }
            let avg = sum / count as f32;
            let level = (avg / step).floor().clamp(0.0, 4.0) as usize;
            let pattern = HALFTONE_PATTERNS[level];
            for (slot, &(x, y)) in cells.iter().enumerate() {
                if x < width && y < rows {
                    let i = (y * width + x) * 4;
                    write_mono(&mut pixels[i..i + 4], pattern[slot] == 1);
                }
            }
        }
    }
}

/// Rounded luma for every pixel; the error state for Floyd-Steinberg.
pub fn grayscale(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(4)
        .map(|px| luma(px[0], px[1], px[2]).round().clamp(0.0, 255.0) as u8)
        .collect()
}

#[inline(always)]
fn spread(gray: &mut [u8], idx: usize, error: f32, weight: f32) {
    gray[idx] = (gray[idx] as f32 + error * weight).round().clamp(0.0, 255.0) as u8;
}

/// Serpentine Floyd-Steinberg over a contiguous block of rows.
///
/// `gray` and `pixels` cover the same rows; `first_row` is the absolute row
/// index of the block so scan direction alternates by image row. Error is
/// only diffused inside the block: the block's last row does not push error
/// downward.
pub fn diffuse_rows(
    gray: &mut [u8],
    pixels: &mut [u8],
    width: usize,
    first_row: usize,
    threshold: f32,
) {
    let rows = gray.len() / width;
    for y in 0..rows {
        let left_to_right = (first_row + y) % 2 == 0;
        let has_below = y + 1 < rows;
        for step in 0..width {
            let x = if left_to_right { step } else { width - 1 - step };
            let idx = y * width + x;
            let old = gray[idx];
            let new = if (old as f32) < threshold { 0u8 } else { 255u8 };
            write_mono(&mut pixels[idx * 4..idx * 4 + 4], new == 255);
            let error = old as f32 - new as f32;
            if error == 0.0 {
                continue;
            }
            // "ahead" follows the scan direction, "behind" is the opposite side.
            let ahead = if left_to_right {
                (x + 1 < width).then_some(x + 1)
            } else {
                x.checked_sub(1)
            };
            let behind = if left_to_right {
                x.checked_sub(1)
            } else {
                (x + 1 < width).then_some(x + 1)
            };
            if let Some(ax) = ahead {
                spread(gray, y * width + ax, error, 7.0 / 16.0);
            }
            if has_below {
                let below = (y + 1) * width;
                if let Some(bx) = behind {
                    spread(gray, below + bx, error, 3.0 / 16.0);
                }
                spread(gray, below + x, error, 5.0 / 16.0);
                if let Some(ax) = ahead {
                    spread(gray, below + ax, error, 1.0 / 16.0);
                }
            }
        }
    }
}
