use crate::codec::RasterImage;

/// Kernel radius for a blur amount, `None` when the blur is disabled.
pub fn kernel_radius(blur: f32) -> Option<usize> {
    if blur.is_nan() || blur <= 0.0 {
        return None;
    }
    Some((blur.floor() as usize).max(1))
}

/// Separable box blur: horizontal pass into a scratch buffer, then vertical.
///
/// Edge pixels average only the in-bounds samples. All four channels,
/// alpha included, are averaged.
pub fn box_blur(src: RasterImage, blur: f32) -> RasterImage {
    let Some(radius) = kernel_radius(blur) else {
        return src;
    };
    let (w, h) = (src.width as usize, src.height as usize);
    let mut tmp = vec![0u8; src.pixels.len()];
    for y in 0..h {
        for x in 0..w {
            let lo = x.saturating_sub(radius);
            let hi = (x + radius).min(w - 1);
            let mut sum = [0u32; 4];
            for sx in lo..=hi {
                let i = (y * w + sx) * 4;
                for c in 0..4 {
                    sum[c] += src.pixels[i + c] as u32;
                }
            }
            write_avg(&mut tmp[(y * w + x) * 4..], &sum, (hi - lo + 1) as f32);
        }
    }

    let mut out = vec![0u8; src.pixels.len()];
    for y in 0..h {
        let lo = y.saturating_sub(radius);
        let hi = (y + radius).min(h - 1);
        for x in 0..w {
            let mut sum = [0u32; 4];
            for sy in lo..=hi {
                let i = (sy * w + x) * 4;
                for c in 0..4 {
                    sum[c] += tmp[i + c] as u32;
                }
            }
            write_avg(&mut out[(y * w + x) * 4..], &sum, (hi - lo + 1) as f32);
        }
    }
    RasterImage {
        width: src.width,
        height: src.height,
        pixels: out,
    }
}

#[inline(always)]
fn write_avg(dst: &mut [u8], sum: &[u32; 4], count: f32) {
    for c in 0..4 {
        dst[c] = (sum[c] as f32 / count).round() as u8;
    }
}
