use crate::config::FilterAdjustments;

/// Per-run tables derived from [`FilterAdjustments`].
#[derive(Debug, Clone)]
pub struct LookupTables {
    /// `None` when contrast is 0 (identity).
    pub contrast_factor: Option<f32>,
    pub midtone_lut: Option<[u8; 256]>,
    pub highlight_lut: Option<[u8; 256]>,
    pub invert: bool,
}

#[inline(always)]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

impl LookupTables {
    pub fn new(adj: &FilterAdjustments) -> Self {
        let contrast_factor = (adj.contrast != 0.0).then(|| {
            let c = adj.contrast;
            (259.0 * (c + 255.0)) / (255.0 * (259.0 - c))
        });
        let midtone_lut = (adj.midtones != 0.0).then(|| {
            let mut lut = [0u8; 256];
            for (i, slot) in lut.iter_mut().enumerate() {
                let weight = 1.0 - (i as f32 - 128.0).abs() / 128.0;
                *slot = clamp_u8(i as f32 + weight * adj.midtones);
            }
            lut
        });
        let highlight_lut = (adj.highlights != 0.0).then(|| {
            let mut lut = [0u8; 256];
            for (i, slot) in lut.iter_mut().enumerate() {
                *slot = clamp_u8(i as f32 + (i as f32 / 255.0) * adj.highlights);
            }
            lut
        });
        Self {
            contrast_factor,
            midtone_lut,
            highlight_lut,
            invert: adj.invert,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.contrast_factor.is_none()
            && self.midtone_lut.is_none()
            && self.highlight_lut.is_none()
            && !self.invert
    }

    /// Apply contrast, then midtone/highlight shift, then invert to a
    /// pixel-aligned RGBA range. Alpha is not touched.
    pub fn apply(&self, pixels: &mut [u8]) {
        if self.is_identity() {
            return;
        }
        let shift_luts = self.midtone_lut.is_some() || self.highlight_lut.is_some();
        for px in pixels.chunks_exact_mut(4) {
            if let Some(cf) = self.contrast_factor {
                for c in px.iter_mut().take(3) {
                    *c = clamp_u8(cf * (*c as f32 - 128.0) + 128.0);
                }
            }
            if shift_luts {
                let sum = px[0] as u32 + px[1] as u32 + px[2] as u32;
                let brightness = (sum as f32 / 3.0).round() as usize;
                let mut delta = 0i32;
                if let Some(lut) = &self.midtone_lut {
                    delta += lut[brightness] as i32 - brightness as i32;
                }
                if let Some(lut) = &self.highlight_lut {
                    delta += lut[brightness] as i32 - brightness as i32;
                }
                if delta != 0 {
                    for c in px.iter_mut().take(3) {
                        *c = (*c as i32 + delta).clamp(0, 255) as u8;
                    }
                }
            }
            if self.invert {
                for c in px.iter_mut().take(3) {
                    *c = 255 - *c;
                }
            }
        }
    }
}
