use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;
use crate::types::PixelFormat;

/// Geometry and buffering of one mirrored display. Immutable once a session begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width:  u32,
    pub height: u32,
    #[serde(alias = "pixelFormat")]
    pub pixel_format: PixelFormat,
    /// Number of frame slots in the pool. Two lets producer and consumer
    /// work on different slots.
    #[serde(alias = "bufferSlots")]
    pub buffer_slots: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 100,
            height: 200,
            pixel_format: PixelFormat::Rgba8888,
            buffer_slots: 2,
        }
    }
}

impl CaptureConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, ..Default::default() }
    }

    /// Bytes in one tightly packed frame.
    pub fn packed_frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel() as usize
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::config(format!(
                "capture size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        // Baseline JPEG cannot describe larger images.
        if self.width > u16::MAX as u32 || self.height > u16::MAX as u32 {
            return Err(CaptureError::config(format!(
                "capture size {}x{} exceeds {}",
                self.width,
                self.height,
                u16::MAX
            )));
        }
        if self.buffer_slots == 0 {
            return Err(CaptureError::config("buffer_slots must be at least 1"));
        }
        if self.buffer_slots == 1 {
            tracing::warn!("buffer_slots=1: producer and consumer will contend for the only slot");
        }
        Ok(())
    }
}

/// How row padding is handled when packing a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StridePolicy {
    /// Drop the padding and emit exactly the requested width.
    #[default]
    Crop,
    /// Keep the padding as extra columns: declared width grows by
    /// `padding_bytes / pixel_stride_bytes`.
    Widen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_fields() {
        let json = r#"{
            "width": 1080,
            "height": 2400,
            "pixelFormat": "rgba8888",
            "bufferSlots": 3
        }"#;

        let cfg: CaptureConfig = serde_json::from_str(json).expect("valid camelCase config");
        assert_eq!(cfg.width, 1080);
        assert_eq!(cfg.height, 2400);
        assert_eq!(cfg.buffer_slots, 3);
        assert_eq!(cfg.packed_frame_len(), 1080 * 2400 * 4);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: CaptureConfig = serde_json::from_str(r#"{"width": 640}"#).unwrap();
        assert_eq!(cfg.width, 640);
        assert_eq!(cfg.height, 200);
        assert_eq!(cfg.buffer_slots, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert!(matches!(CaptureConfig::new(0, 10).validate(), Err(CaptureError::Config { .. })));
        assert!(matches!(CaptureConfig::new(70_000, 10).validate(), Err(CaptureError::Config { .. })));
        let no_slots = CaptureConfig { buffer_slots: 0, ..Default::default() };
        assert!(no_slots.validate().is_err());
    }

    #[test]
    fn stride_policy_names() {
        let p: StridePolicy = serde_json::from_str(r#""widen""#).unwrap();
        assert_eq!(p, StridePolicy::Widen);
        assert_eq!(StridePolicy::default(), StridePolicy::Crop);
    }
}
