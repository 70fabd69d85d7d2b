use crate::error::{ProcessError, ProcessResult};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// Interleaved RGBA8 raster, `pixels.len() == width * height * 4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RasterImage {
    /// Wrap an existing buffer, checking that its length matches the dimensions.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != expected_len(width, height)? {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Solid single-color image; used by tests and as a scratch canvas.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_consistent(&self) -> bool {
        expected_len(self.width, self.height) == Some(self.pixels.len())
    }
}

fn expected_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|p| p.checked_mul(4))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg,
    Unknown,
}

impl RasterFormat {
    /// MIME type used for the `data:` output URI.
    pub fn mime(self) -> Option<mime::Mime> {
        match self {
            RasterFormat::Png => Some(mime::IMAGE_PNG),
            RasterFormat::Jpeg => Some(mime::IMAGE_JPEG),
            RasterFormat::Unknown => None,
        }
    }

    fn image_format(self) -> Option<ImageFormat> {
        match self {
            RasterFormat::Png => Some(ImageFormat::Png),
            RasterFormat::Jpeg => Some(ImageFormat::Jpeg),
            RasterFormat::Unknown => None,
        }
    }
}

/// Identify the container by its leading magic bytes.
pub fn detect_format(bytes: &[u8]) -> RasterFormat {
    if bytes.starts_with(&PNG_SIGNATURE) {
        RasterFormat::Png
    } else if bytes.starts_with(&JPEG_SOI) {
        RasterFormat::Jpeg
    } else {
        RasterFormat::Unknown
    }
}

/// Decode `bytes` as `format` into an RGBA8 raster.
pub fn decode(bytes: &[u8], format: RasterFormat) -> ProcessResult<RasterImage> {
    let image_format = format.image_format().ok_or(ProcessError::UnsupportedFormat)?;
    let mut img = image::load_from_memory_with_format(bytes, image_format)?;
    if format == RasterFormat::Jpeg
        && let Some(tag) = exif_orientation(bytes)
    {
        img = apply_exif_orientation(img, tag);
    }
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(ProcessError::Decode(format!(
            "image has empty dimensions {width}x{height}"
        )));
    }
    Ok(RasterImage {
        width,
        height,
        pixels: rgba.into_raw(),
    })
}

/// Encode a raster back into `format`. `quality` only applies to JPEG.
pub fn encode(image: &RasterImage, format: RasterFormat, quality: u8) -> ProcessResult<Vec<u8>> {
    let buf = RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .filter(|_| image.is_consistent())
        .ok_or_else(|| {
            ProcessError::Encode(format!(
                "buffer length {} does not match {}x{}",
                image.pixels.len(),
                image.width,
                image.height
            ))
        })?;
    let mut bytes = Vec::new();
    match format {
        RasterFormat::Png => {
            DynamicImage::ImageRgba8(buf)
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map_err(|e| ProcessError::Encode(format!("png encode failed: {e}")))?;
        }
        RasterFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(buf).to_rgb8());
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut bytes,
                quality.clamp(1, 100),
            );
            rgb.write_with_encoder(encoder)
                .map_err(|e| ProcessError::Encode(format!("jpeg encode failed: {e}")))?;
        }
        RasterFormat::Unknown => return Err(ProcessError::UnsupportedFormat),
    }
    Ok(bytes)
}

/// Read the EXIF orientation (1,3,6,8) from a JPEG container, if present.
fn exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    let field = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    match field.value {
        exif::Value::Short(ref v) => v.first().copied(),
        _ => field.value.get_uint(0).map(|v| v as u16),
    }
}

fn apply_exif_orientation(img: DynamicImage, tag: u16) -> DynamicImage {
    match tag {
        3 => DynamicImage::ImageRgba8(image::imageops::rotate180(&img)),
        6 => DynamicImage::ImageRgba8(image::imageops::rotate90(&img)),
        8 => DynamicImage::ImageRgba8(image::imageops::rotate270(&img)),
        // Mirrored tags (2,4,5,7) are left as decoded.
        _ => img,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RasterImage {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[
                    (x * 255 / width.max(1)) as u8,
                    (y * 255 / height.max(1)) as u8,
                    ((x + y) * 7 % 256) as u8,
                    if (x + y) % 3 == 0 { 128 } else { 255 },
                ]);
            }
        }
        RasterImage::from_raw(width, height, pixels).unwrap()
    }

    #[test]
    fn detects_magic_bytes() {
        assert_eq!(detect_format(&PNG_SIGNATURE), RasterFormat::Png);
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0]), RasterFormat::Jpeg);
        assert_eq!(detect_format(&[0, 0, 0, 0]), RasterFormat::Unknown);
        assert_eq!(detect_format(&[]), RasterFormat::Unknown);
    }

    #[test]
    fn png_round_trip_is_exact() {
        for (w, h) in [(1, 1), (3, 5), (17, 9)] {
            let img = gradient(w, h);
            let bytes = encode(&img, RasterFormat::Png, 90).unwrap();
            assert_eq!(detect_format(&bytes), RasterFormat::Png);
            let back = decode(&bytes, RasterFormat::Png).unwrap();
            assert_eq!(back, img);
        }
    }

    #[test]
    fn jpeg_round_trip_is_close() {
        let img = RasterImage::filled(16, 16, [120, 60, 200, 255]);
        let bytes = encode(&img, RasterFormat::Jpeg, 90).unwrap();
        assert_eq!(detect_format(&bytes), RasterFormat::Jpeg);
        let back = decode(&bytes, RasterFormat::Jpeg).unwrap();
        assert_eq!((back.width, back.height), (16, 16));
        for (a, b) in img.pixels.iter().zip(back.pixels.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 8, "{a} vs {b}");
        }
    }

    #[test]
    fn truncated_png_fails_to_decode() {
        let bytes = encode(&gradient(8, 8), RasterFormat::Png, 90).unwrap();
        let err = decode(&bytes[..bytes.len() / 2], RasterFormat::Png).unwrap_err();
        assert!(matches!(err, ProcessError::Decode(_)));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = decode(&[0, 0, 0, 0], RasterFormat::Unknown).unwrap_err();
        assert!(matches!(err, ProcessError::UnsupportedFormat));
    }

    #[test]
    fn encode_rejects_inconsistent_buffer() {
        let img = RasterImage {
            width: 4,
            height: 4,
            pixels: vec![0; 10],
        };
        let err = encode(&img, RasterFormat::Png, 90).unwrap_err();
        assert!(matches!(err, ProcessError::Encode(_)));
    }
}
