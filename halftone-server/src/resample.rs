//! Raster resizing.
//!
//! Two independent entry points live here:
//! - [`scale`] / [`scale_by`]: the tone-path resampler (area average when
//!   shrinking on both axes, bilinear otherwise).
//! - [`fit_pixel_budget`]: a cheap nearest-neighbor reduction used only by the
//!   dither path to bound processing time on very large inputs.

use crate::codec::RasterImage;
use crate::config::ResampleBackend;
use crate::error::{ProcessError, ProcessResult};
use image::RgbaImage;
use image::imageops::{self, FilterType};
use once_cell::sync::OnceCell;

/// Pixel budget above which the dither path nearest-neighbor downscales.
pub const DEFAULT_DITHER_PIXEL_BUDGET: usize = 2_000_000;

static IMAGEOPS_AVAILABLE: OnceCell<bool> = OnceCell::new();

/// Pick the resampling backend once at startup.
///
/// `ImageOps` is only honoured when a probe resize through `image::imageops`
/// yields the requested geometry; otherwise the portable path is used.
pub fn resolve_backend(requested: ResampleBackend) -> ResampleBackend {
    match requested {
        ResampleBackend::Portable => ResampleBackend::Portable,
        ResampleBackend::ImageOps => {
            let available = *IMAGEOPS_AVAILABLE.get_or_init(|| {
                let probe = RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
                let out = imageops::resize(&probe, 2, 3, FilterType::Triangle);
                out.dimensions() == (2, 3)
            });
            if available {
                ResampleBackend::ImageOps
            } else {
                tracing::warn!("imageops resize probe failed; using portable resampler");
                ResampleBackend::Portable
            }
        }
    }
}

/// Resize by a uniform factor; target dimensions are rounded and at least 1.
///
/// Fails with [`ProcessError::Decode`] when the buffer length does not match
/// the dimensions, whichever backend is selected.
pub fn scale_by(
    src: RasterImage,
    factor: f32,
    backend: ResampleBackend,
) -> ProcessResult<RasterImage> {
    if !src.is_consistent() {
        return Err(ProcessError::Decode(format!(
            "{} bytes for a {}x{} RGBA raster",
            src.pixels.len(),
            src.width,
            src.height
        )));
    }
    if (factor - 1.0).abs() < f32::EPSILON || !factor.is_finite() || factor <= 0.0 {
        return Ok(src);
    }
    let dst_w = ((src.width as f32 * factor).round() as u32).max(1);
    let dst_h = ((src.height as f32 * factor).round() as u32).max(1);
    match backend {
        ResampleBackend::Portable => Ok(scale(src, dst_w, dst_h)),
        ResampleBackend::ImageOps => scale_imageops(src, dst_w, dst_h),
    }
}

fn scale_imageops(src: RasterImage, dst_w: u32, dst_h: u32) -> ProcessResult<RasterImage> {
    let (w, h) = (src.width, src.height);
    let buf = RgbaImage::from_raw(w, h, src.pixels)
        .ok_or_else(|| ProcessError::Decode(format!("short buffer for a {w}x{h} raster")))?;
    let out = imageops::resize(&buf, dst_w, dst_h, FilterType::Triangle);
    Ok(RasterImage {
        width: dst_w,
        height: dst_h,
        pixels: out.into_raw(),
    })
}

/// Resize `src` to exactly `dst_w` x `dst_h`.
pub fn scale(src: RasterImage, dst_w: u32, dst_h: u32) -> RasterImage {
    let dst_w = dst_w.max(1);
    let dst_h = dst_h.max(1);
    if (dst_w, dst_h) == (src.width, src.height) {
        return src;
    }
    if dst_w < src.width && dst_h < src.height {
        area_average(&src, dst_w, dst_h)
    } else {
        bilinear(&src, dst_w, dst_h)
    }
}

fn area_average(src: &RasterImage, dst_w: u32, dst_h: u32) -> RasterImage {
    let (sw, sh) = (src.width as usize, src.height as usize);
    let (dw, dh) = (dst_w as usize, dst_h as usize);
    let sx = sw as f64 / dw as f64;
    let sy = sh as f64 / dh as f64;
    let mut out = vec![0u8; dw * dh * 4];

    for dy in 0..dh {
        let y0 = ((dy as f64 * sy).floor() as usize).min(sh - 1);
        let y1 = (((dy + 1) as f64 * sy).ceil() as usize).clamp(y0 + 1, sh);
        for dx in 0..dw {
            let x0 = ((dx as f64 * sx).floor() as usize).min(sw - 1);
            let x1 = (((dx + 1) as f64 * sx).ceil() as usize).clamp(x0 + 1, sw);
            let mut sum = [0u64; 4];
            for y in y0..y1 {
                let row = y * sw;
                for x in x0..x1 {
                    let i = (row + x) * 4;
                    for c in 0..4 {
                        sum[c] += src.pixels[i + c] as u64;
                    }
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as f64;
            let o = (dy * dw + dx) * 4;
            for c in 0..4 {
                out[o + c] = (sum[c] as f64 / count).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    RasterImage {
        width: dst_w,
        height: dst_h,
        pixels: out,
    }
}

fn bilinear(src: &RasterImage, dst_w: u32, dst_h: u32) -> RasterImage {
    let (sw, sh) = (src.width as usize, src.height as usize);
    let (dw, dh) = (dst_w as usize, dst_h as usize);
    let sx = sw as f32 / dw as f32;
    let sy = sh as f32 / dh as f32;
    let max_x = (sw - 1) as f32;
    let max_y = (sh - 1) as f32;
    let mut out = vec![0u8; dw * dh * 4];

    for dy in 0..dh {
        let fy = ((dy as f32 + 0.5) * sy - 0.5).clamp(0.0, max_y);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(sh - 1);
        let ty = fy - y0 as f32;
        for dx in 0..dw {
            let fx = ((dx as f32 + 0.5) * sx - 0.5).clamp(0.0, max_x);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(sw - 1);
            let tx = fx - x0 as f32;

            let p00 = (y0 * sw + x0) * 4;
            let p10 = (y0 * sw + x1) * 4;
            let p01 = (y1 * sw + x0) * 4;
            let p11 = (y1 * sw + x1) * 4;
            let o = (dy * dw + dx) * 4;
            for c in 0..4 {
                let top = src.pixels[p00 + c] as f32 * (1.0 - tx) + src.pixels[p10 + c] as f32 * tx;
                let bottom =
                    src.pixels[p01 + c] as f32 * (1.0 - tx) + src.pixels[p11 + c] as f32 * tx;
                let v = top * (1.0 - ty) + bottom * ty;
                out[o + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    RasterImage {
        width: dst_w,
        height: dst_h,
        pixels: out,
    }
}

/// Nearest-neighbor downscale so that `width * height <= budget`.
///
/// Returns the input untouched when it already fits.
pub fn fit_pixel_budget(src: RasterImage, budget: usize) -> RasterImage {
    let total = src.pixel_count();
    if budget == 0 || total <= budget {
        return src;
    }
    let f = (budget as f64 / total as f64).sqrt();
    let dw = ((src.width as f64 * f).floor() as u32).max(1);
    let dh = ((src.height as f64 * f).floor() as u32).max(1);
    // Very thin images clamp one axis to 1; shrink the other to stay within budget.
    let dh = dh.min((budget / dw as usize).max(1) as u32);
    let dw = dw.min((budget / dh as usize).max(1) as u32);
    tracing::debug!(
        from_w = src.width,
        from_h = src.height,
        to_w = dw,
        to_h = dh,
        budget,
        "nearest-neighbor downscale before dithering"
    );
    let (sw, sh) = (src.width as u64, src.height as u64);
    let mut out = Vec::with_capacity(dw as usize * dh as usize * 4);
    for y in 0..dh as u64 {
        let src_y = (y * sh / dh as u64) as usize;
        for x in 0..dw as u64 {
            let src_x = (x * sw / dw as u64) as usize;
            let i = (src_y * sw as usize + src_x) * 4;
            out.extend_from_slice(&src.pixels[i..i + 4]);
        }
    }
    RasterImage {
        width: dw,
        height: dh,
        pixels: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_size_is_identity() {
        let img = RasterImage::filled(5, 3, [1, 2, 3, 4]);
        assert_eq!(scale(img.clone(), 5, 3), img);
        assert_eq!(scale_by(img.clone(), 1.0, ResampleBackend::Portable).unwrap(), img);
    }

    #[test]
    fn area_average_means_each_cell() {
        // 4x2 -> 2x1: each destination pixel averages a 2x2 block.
        let pixels = vec![
            0, 0, 0, 255, 100, 100, 100, 255, 10, 10, 10, 0, 20, 20, 20, 0, //
            50, 50, 50, 255, 150, 150, 150, 255, 30, 30, 30, 0, 40, 40, 40, 0,
        ];
        let img = RasterImage::from_raw(4, 2, pixels).unwrap();
        let out = scale(img, 2, 1);
        assert_eq!(out.pixels, vec![75, 75, 75, 255, 25, 25, 25, 0]);
    }

    #[test]
    fn bilinear_upscale_blends_neighbors() {
        let pixels = vec![0, 0, 0, 0, 200, 200, 200, 200];
        let img = RasterImage::from_raw(2, 1, pixels).unwrap();
        let out = scale(img, 4, 1);
        assert_eq!(out.width, 4);
        // Edge samples clamp to the source edge; interior samples interpolate.
        assert_eq!(out.pixels[0..4], [0, 0, 0, 0]);
        assert_eq!(out.pixels[4..8], [50, 50, 50, 50]);
        assert_eq!(out.pixels[8..12], [150, 150, 150, 150]);
        assert_eq!(out.pixels[12..16], [200, 200, 200, 200]);
    }

    #[test]
    fn mixed_axis_resize_uses_bilinear() {
        let img = RasterImage::filled(8, 2, [90, 40, 10, 255]);
        let out = scale(img, 4, 6);
        assert_eq!((out.width, out.height), (4, 6));
        assert!(out.pixels.chunks_exact(4).all(|p| p == [90, 40, 10, 255]));
    }

    #[test]
    fn scale_by_rounds_dimensions() {
        let img = RasterImage::filled(5, 3, [0, 0, 0, 255]);
        let out = scale_by(img, 0.5, ResampleBackend::Portable).unwrap();
        assert_eq!((out.width, out.height), (3, 2));
        let img = RasterImage::filled(5, 3, [0, 0, 0, 255]);
        let out = scale_by(img, 2.0, ResampleBackend::Portable).unwrap();
        assert_eq!((out.width, out.height), (10, 6));
    }

    #[test]
    fn imageops_backend_matches_geometry() {
        let backend = resolve_backend(ResampleBackend::ImageOps);
        let img = RasterImage::filled(10, 10, [7, 7, 7, 255]);
        let out = scale_by(img, 0.5, backend).unwrap();
        assert_eq!((out.width, out.height), (5, 5));
        assert!(out.is_consistent());
    }

    #[test]
    fn mismatched_buffer_is_an_error_on_both_backends() {
        for backend in [ResampleBackend::Portable, ResampleBackend::ImageOps] {
            let short = RasterImage {
                width: 4,
                height: 4,
                pixels: vec![0; 4 * 4 * 4 - 4],
            };
            let err = scale_by(short, 0.5, backend).unwrap_err();
            assert!(matches!(err, ProcessError::Decode(_)), "{backend:?}: {err}");
        }
        // Factor 1.0 does not bypass the check.
        let long = RasterImage {
            width: 1,
            height: 1,
            pixels: vec![0; 8],
        };
        assert!(scale_by(long, 1.0, ResampleBackend::Portable).is_err());
    }

    #[test]
    fn fit_pixel_budget_is_nearest_neighbor() {
        let mut pixels = Vec::new();
        for i in 0..16u8 {
            pixels.extend_from_slice(&[i, i, i, 255]);
        }
        let img = RasterImage::from_raw(4, 4, pixels).unwrap();
        let out = fit_pixel_budget(img, 4);
        assert_eq!((out.width, out.height), (2, 2));
        let values: Vec<u8> = out.pixels.chunks_exact(4).map(|p| p[0]).collect();
        assert_eq!(values, vec![0, 2, 8, 10]);
    }

    #[test]
    fn fit_pixel_budget_leaves_small_images() {
        let img = RasterImage::filled(10, 10, [1, 1, 1, 1]);
        assert_eq!(fit_pixel_budget(img.clone(), 100), img);
    }

    proptest! {
        #[test]
        fn uniform_area_average_stays_uniform(
            w in 2u32..24,
            h in 2u32..24,
            rgba in any::<[u8; 4]>(),
            fw in 0.05f64..0.99,
            fh in 0.05f64..0.99,
        ) {
            let dw = ((w as f64 * fw) as u32).clamp(1, w - 1);
            let dh = ((h as f64 * fh) as u32).clamp(1, h - 1);
            let out = scale(RasterImage::filled(w, h, rgba), dw, dh);
            prop_assert_eq!((out.width, out.height), (dw, dh));
            prop_assert!(out.pixels.chunks_exact(4).all(|p| p == rgba));
        }

        #[test]
        fn budget_is_respected(w in 1u32..200, h in 1u32..200, budget in 1usize..5000) {
            let out = fit_pixel_budget(RasterImage::filled(w, h, [9, 9, 9, 9]), budget);
            prop_assert!(out.pixel_count() <= budget);
            prop_assert!(out.is_consistent());
        }
    }
}
