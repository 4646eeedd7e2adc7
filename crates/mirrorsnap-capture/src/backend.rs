//! Seams between the capture session and the platform.

use async_trait::async_trait;
use mirrorsnap_core::{AuthorizationToken, CaptureConfig, CaptureResult, SessionId};
use tracing::info;

use crate::interrupt::InterruptHandle;
use crate::pool::FrameProducer;

/// Consent flow that yields a capture token (portal dialog, OS prompt, ...).
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// One token per call; the session consumes it.
    async fn request_authorization(&self) -> CaptureResult<AuthorizationToken>;
}

/// Factory for mirrored-display handles.
#[async_trait]
pub trait DisplayMirror: Send + Sync {
    /// Validate `token` and bind a new mirror to `producer`.
    ///
    /// Must fail with `Authorization` for an invalid, expired or reused token
    /// and with `Resource` when the platform cannot create the mirror. The
    /// returned handle does not deliver frames until [`MirrorHandle::start`].
    /// `interrupt` is to be fired if the platform ends the mirror on its own.
    async fn create_mirror(
        &self,
        token: AuthorizationToken,
        config: &CaptureConfig,
        producer: FrameProducer,
        interrupt: InterruptHandle,
    ) -> CaptureResult<Box<dyn MirrorHandle>>;

    /// Give back a token that will never reach [`DisplayMirror::create_mirror`]
    /// so the platform can free whatever it reserved for it.
    fn discard_token(&self, token: AuthorizationToken) {
        drop(token);
    }
}

/// A live mirroring relationship between the display and one pool.
pub trait MirrorHandle: Send {
    /// Begin streaming frames into the pool.
    fn start(&mut self) -> CaptureResult<()>;

    /// Tear the mirror down. Idempotent.
    fn release(&mut self);
}

/// Registration that keeps the process visibly alive while capturing
/// (foreground service notice, tray indicator, ...).
pub trait ForegroundPresence: Send + Sync {
    fn register(&self, session: SessionId) -> CaptureResult<()>;

    fn withdraw(&self, session: SessionId);
}

/// Presence that only announces itself in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggedPresence;

impl ForegroundPresence for LoggedPresence {
    fn register(&self, session: SessionId) -> CaptureResult<()> {
        info!("Session[{session}] screen capture active");
        Ok(())
    }

    fn withdraw(&self, session: SessionId) {
        info!("Session[{session}] screen capture notice withdrawn");
    }
}
