pub mod config;
pub mod errors;
pub mod types;

pub use config::{CaptureConfig, StridePolicy};
pub use errors::{CaptureError, CaptureResult};
pub use types::*;
