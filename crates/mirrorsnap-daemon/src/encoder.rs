//! JPEG still-image encoder.
//!
//! ```text
//! PackedImage (RGBA, w*h*4)
//!   → drop alpha (JPEG has no alpha channel)
//!   → image::codecs::jpeg::JpegEncoder (baseline, quality q)
//!   → EncodedArtifact { bytes, "image/jpeg", quality_used }
//! ```

use std::time::SystemTime;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;
use mirrorsnap_core::{CaptureError, CaptureResult, EncodedArtifact, PackedImage, JPEG_MIME};

/// Encodes packed RGBA frames at a fixed quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegEncoder {
    quality: u8,
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self { quality: Self::DEFAULT_QUALITY }
    }
}

impl JpegEncoder {
    pub const DEFAULT_QUALITY: u8 = 80;

    /// `quality` must be within `0..=100`. The codec's floor is 1, so 0
    /// encodes (and reports) as 1.
    pub fn new(quality: u8) -> CaptureResult<Self> {
        if quality > 100 {
            return Err(CaptureError::config(format!("JPEG quality {quality} outside 0..=100")));
        }
        Ok(Self { quality })
    }

    /// Quality actually handed to the codec.
    pub fn effective_quality(&self) -> u8 {
        self.quality.max(1)
    }

    pub fn encode(&self, img: &PackedImage) -> CaptureResult<EncodedArtifact> {
        if img.width == 0 || img.height == 0 {
            return Err(CaptureError::encode(format!("empty image {}x{}", img.width, img.height)));
        }
        let expected = PackedImage::expected_len(img.width, img.height);
        if img.pixels.len() != expected {
            return Err(CaptureError::encode(format!(
                "pixel buffer is {} bytes, {}x{} RGBA needs {expected}",
                img.pixels.len(),
                img.width,
                img.height
            )));
        }

        let rgb: Vec<u8> = img
            .pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect();

        let quality = self.effective_quality();
        let mut out = Vec::with_capacity(expected / 8);
        ImageJpegEncoder::new_with_quality(&mut out, quality)
            .encode(&rgb, img.width, img.height, ExtendedColorType::Rgb8)
            .map_err(|e| CaptureError::encode(format!("JPEG encoder: {e}")))?;

        Ok(EncodedArtifact {
            bytes: Bytes::from(out),
            mime_type: JPEG_MIME,
            quality_used: quality,
            width: img.width,
            height: img.height,
            session_id: None,
            sequence: 0,
            captured_at: SystemTime::now(),
        })
    }
}
