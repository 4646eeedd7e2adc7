//! Daemon configuration: JSON file plus environment overrides.
//!
//! ```json
//! {
//!   "capture": { "width": 100, "height": 200, "pixelFormat": "RGBA_8888", "bufferSlots": 2 },
//!   "quality": 80,
//!   "stridePolicy": "crop",
//!   "snapshotIntervalMs": 1000,
//!   "outputDir": "/tmp/mirrorsnap",
//!   "autostart": true,
//!   "backend": "synthetic",
//!   "syntheticFps": 30
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use mirrorsnap_core::{CaptureConfig, CaptureError, CaptureResult, StridePolicy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::encoder::JpegEncoder;

pub const CONFIG_PATH_ENV: &str = "MIRRORSNAP_CONFIG";
pub const QUALITY_ENV: &str = "MIRRORSNAP_QUALITY";
pub const INTERVAL_ENV: &str = "MIRRORSNAP_INTERVAL_MS";
pub const OUTPUT_DIR_ENV: &str = "MIRRORSNAP_OUTPUT_DIR";
pub const AUTOSTART_ENV: &str = "MIRRORSNAP_AUTOSTART";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Synthetic,
    #[serde(alias = "pipe_wire", alias = "pipeWire")]
    PipeWire,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub capture: CaptureConfig,
    pub quality: u8,
    #[serde(alias = "stridePolicy")]
    pub stride_policy: StridePolicy,
    #[serde(alias = "snapshotIntervalMs")]
    pub snapshot_interval_ms: u64,
    /// Also write every snapshot here when set.
    #[serde(alias = "outputDir")]
    pub output_dir: Option<PathBuf>,
    /// Start a session and the snapshot loop right after launch.
    pub autostart: bool,
    pub backend: BackendKind,
    /// Synthetic backend only: test-pattern frame rate (0 = no painter).
    #[serde(alias = "syntheticFps")]
    pub synthetic_fps: u32,
    /// Synthetic backend only: bytes of padding per row.
    #[serde(alias = "syntheticRowPadding")]
    pub synthetic_row_padding: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            quality: JpegEncoder::DEFAULT_QUALITY,
            stride_policy: StridePolicy::default(),
            snapshot_interval_ms: 1000,
            output_dir: None,
            autostart: false,
            backend: BackendKind::default(),
            synthetic_fps: 30,
            synthetic_row_padding: 0,
        }
    }
}

impl DaemonConfig {
    /// File named by `MIRRORSNAP_CONFIG` (defaults if unset), then env
    /// overrides, then validation.
    pub fn load() -> CaptureResult<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> CaptureResult<Self> {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CaptureResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::config(format!("reading {}: {e}", path.display())))?;
        let config = Self::from_json(&text)
            .map_err(|e| CaptureError::config(format!("{}: {e}", path.display())))?;
        info!("Config loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> CaptureResult<()> {
        if let Some(v) = lookup(QUALITY_ENV) {
            self.quality = parse_env(QUALITY_ENV, &v)?;
        }
        if let Some(v) = lookup(INTERVAL_ENV) {
            self.snapshot_interval_ms = parse_env(INTERVAL_ENV, &v)?;
        }
        if let Some(v) = lookup(OUTPUT_DIR_ENV) {
            self.output_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup(AUTOSTART_ENV) {
            self.autostart = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(CaptureError::config(format!("{AUTOSTART_ENV}={other} is not a boolean")))
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> CaptureResult<()> {
        self.capture.validate()?;
        JpegEncoder::new(self.quality)?;
        if self.snapshot_interval_ms == 0 {
            return Err(CaptureError::config("snapshot interval must be > 0 ms"));
        }
        if self.backend == BackendKind::PipeWire && !cfg!(all(target_os = "linux", feature = "pipewire")) {
            return Err(CaptureError::config(
                "backend \"pipewire\" requires a Linux build with the `pipewire` feature",
            ));
        }
        if self.backend != BackendKind::Synthetic && self.synthetic_fps > 0 {
            warn!("syntheticFps ignored for backend {:?}", self.backend);
        }
        Ok(())
    }

    pub fn encoder(&self) -> CaptureResult<JpegEncoder> {
        JpegEncoder::new(self.quality)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> CaptureResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CaptureError::config(format!("{key}={value}: {e}")))
}
