use std::any::Any;
use std::fmt;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// MARK: - PixelFormat

/// Pixel layout of mirrored frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    #[default]
    #[serde(alias = "RGBA_8888", alias = "RGBA8888")]
    Rgba8888,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8888 => 4,
        }
    }
}

// MARK: - SessionId

/// Monotonic identifier of one capture session within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// MARK: - SessionState

/// Lifecycle of the process-wide capture session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

impl SessionState {
    /// Whether a mirrored display handle may be alive in this state.
    pub fn holds_mirror(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

// MARK: - TerminationReason

/// Why the platform ended a mirroring relationship on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Consent was withdrawn (user revoked the capture permission).
    Revoked,
    /// Display topology changed under the mirror.
    DisplayChanged,
    /// The producer reached end of stream.
    StreamEnded,
    /// The producer failed.
    StreamError(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revoked => write!(f, "permission revoked"),
            Self::DisplayChanged => write!(f, "display topology changed"),
            Self::StreamEnded => write!(f, "stream ended"),
            Self::StreamError(e) => write!(f, "stream error: {e}"),
        }
    }
}

// MARK: - AuthorizationToken

/// Single-use capability required to create a mirrored display handle.
///
/// Not `Clone`: a token is moved into `CaptureSession::begin` and can be
/// presented once. Backends may attach a
/// grant payload (e.g. a portal stream descriptor) and read it back with
/// [`AuthorizationToken::take_grant`].
pub struct AuthorizationToken {
    id: u64,
    expires_at: Option<Instant>,
    grant: Option<Box<dyn Any + Send>>,
}

impl AuthorizationToken {
    pub fn new(id: u64) -> Self {
        Self { id, expires_at: None, grant: None }
    }

    pub fn with_expiry(mut self, expires_at: Instant) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_grant<T: Any + Send>(mut self, grant: T) -> Self {
        self.grant = Some(Box::new(grant));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Remove the backend grant if it has type `T`.
    pub fn take_grant<T: Any + Send>(&mut self) -> Option<T> {
        let grant = self.grant.take()?;
        match grant.downcast::<T>() {
            Ok(g) => Some(*g),
            Err(other) => {
                self.grant = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationToken")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .field("has_grant", &self.grant.is_some())
            .finish()
    }
}

// MARK: - RawFrame

/// One mirrored frame exactly as the producer wrote it, row padding included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub pixel_buffer:       Vec<u8>,
    pub row_stride_bytes:   u32,
    pub pixel_stride_bytes: u32,
    pub width:  u32,
    pub height: u32,
}

impl RawFrame {
    /// Bytes of alignment padding at the end of every row.
    ///
    /// Zero when the row stride is not larger than a packed row.
    pub fn padding_bytes(&self) -> u32 {
        self.row_stride_bytes
            .saturating_sub(self.pixel_stride_bytes.saturating_mul(self.width))
    }
}

// MARK: - PackedImage

/// Tightly packed RGBA pixels, `width * height * 4` bytes, no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedImage {
    pub pixels: Vec<u8>,
    pub width:  u32,
    pub height: u32,
}

impl PackedImage {
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }
}

// MARK: - EncodedArtifact

pub const JPEG_MIME: &str = "image/jpeg";

/// Finished still image handed to the consumer. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub bytes:        Bytes,
    pub mime_type:    &'static str,
    pub quality_used: u8,
    pub width:        u32,
    pub height:       u32,
    /// Session that produced the artifact (set by the capture session).
    pub session_id:   Option<SessionId>,
    /// Per-session capture counter, starting at 1.
    pub sequence:     u64,
    pub captured_at:  SystemTime,
}

impl EncodedArtifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
