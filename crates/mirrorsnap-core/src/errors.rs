use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Token missing, expired, denied, or already used.
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// The platform could not allocate the mirror or register foreground presence.
    #[error("Resource unavailable: {reason}")]
    Resource { reason: String },

    #[error("Invalid state: `{operation}` not allowed while {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("Encode failed: {reason}")]
    Encode { reason: String },

    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Configuration invalid: {reason}")]
    Config { reason: String },

    /// A worker task panicked or was cancelled before replying.
    #[error("Capture task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Session controller is no longer running")]
    ControllerClosed,
}

impl CaptureError {
    pub fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization { reason: reason.into() }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource { reason: reason.into() }
    }

    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState { operation, state: state.to_string() }
    }

    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode { reason: reason.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame { reason: reason.into() }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    pub fn task_failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed { reason: reason.into() }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
