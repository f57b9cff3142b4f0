//! Avatar image decoding and rescaling.
//!
//! Every payload is fully decoded before it is cached, so a file whose
//! header is intact but whose pixel data is damaged never reaches the UI.
//! The default decoder accepts PNG only.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Limits, Rgba, RgbaImage};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Largest width or height the decoder accepts.
pub const MAX_DIMENSION: u32 = 4096;

/// Dimensions of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("not a PNG image")]
    NotPng,

    #[error("malformed image: {0}")]
    Malformed(String),

    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Turns avatar bytes into something displayable.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<ImageInfo, DecodeError>;

    /// Re-encodes `data` at exactly `width` x `height`.
    fn rescale(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError>;
}

/// Full PNG decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngDecoder;

impl PngDecoder {
    fn load(&self, data: &[u8]) -> Result<DynamicImage, DecodeError> {
        if !data.starts_with(&PNG_SIGNATURE) {
            return Err(DecodeError::NotPng);
        }
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_DIMENSION);
        limits.max_image_height = Some(MAX_DIMENSION);

        let mut reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Png);
        reader.limits(limits);
        reader
            .decode()
            .map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

impl ImageDecoder for PngDecoder {
    fn decode(&self, data: &[u8]) -> Result<ImageInfo, DecodeError> {
        let image = self.load(data)?;
        Ok(ImageInfo {
            width: image.width(),
            height: image.height(),
        })
    }

    fn rescale(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
        let scaled = self
            .load(data)?
            .resize_exact(width, height, FilterType::CatmullRom);
        encode_png(&scaled)
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, DecodeError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| DecodeError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Encodes a solid grey PNG of the given size, used as a placeholder avatar.
pub fn placeholder_png(width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    let pixels = RgbaImage::from_pixel(width, height, Rgba([0x80, 0x80, 0x80, 0xFF]));
    encode_png(&DynamicImage::ImageRgba8(pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Offset of the first chunk after IHDR: signature, length, type, body, CRC.
    const AFTER_IHDR: usize = 8 + 4 + 4 + 13 + 4;

    #[test]
    fn decodes_placeholder() {
        let png = placeholder_png(64, 48).unwrap();
        let info = PngDecoder.decode(&png).unwrap();
        assert_eq!(
            info,
            ImageInfo {
                width: 64,
                height: 48
            }
        );
    }

    #[test]
    fn rejects_non_png() {
        assert_eq!(PngDecoder.decode(b"GIF89a......"), Err(DecodeError::NotPng));
        assert_eq!(PngDecoder.decode(&[]), Err(DecodeError::NotPng));
    }

    #[test]
    fn rejects_truncated_image() {
        let png = placeholder_png(8, 8).unwrap();
        assert!(matches!(
            PngDecoder.decode(&png[..20]),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_intact_header_with_damaged_pixels() {
        let png = placeholder_png(16, 16).unwrap();
        let mut damaged = png[..AFTER_IHDR].to_vec();
        // IDAT whose CRC is valid but whose body is not a zlib stream
        let body = b"IDAT\xde\xad\xbe\xef\xde\xad\xbe\xef";
        damaged.extend_from_slice(&8u32.to_be_bytes());
        damaged.extend_from_slice(body);
        damaged.extend_from_slice(&crc32fast::hash(body).to_be_bytes());
        damaged.extend_from_slice(&png[png.len() - 12..]);

        assert!(matches!(
            PngDecoder.decode(&damaged),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_oversized_dimensions() {
        let png = placeholder_png(MAX_DIMENSION + 1, 1).unwrap();
        assert!(matches!(
            PngDecoder.decode(&png),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rescale_changes_dimensions() {
        let png = placeholder_png(200, 100).unwrap();
        let scaled = PngDecoder.rescale(&png, 64, 64).unwrap();
        assert_eq!(
            PngDecoder.decode(&scaled).unwrap(),
            ImageInfo {
                width: 64,
                height: 64
            }
        );
    }

    #[test]
    fn rescale_rejects_garbage() {
        assert_eq!(
            PngDecoder.rescale(b"not an image", 64, 64),
            Err(DecodeError::NotPng)
        );
    }
}
