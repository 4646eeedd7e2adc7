//! `CaptureSession`: one mirrored display handle plus its buffer pool for
//! the lifetime of one recording.
//!
//! ```text
//! Created ──begin(token)──► Begun ──end()──► Ended
//!    │                                  ▲
//!    └──────── begin() failed ──────────┘
//! ```
//!
//! `capture_once` takes `&self` so the controller can run it on the blocking
//! pool while keeping the session shared; the phase lives behind a mutex and
//! is re-checked by every operation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mirrorsnap_capture::{
    correct, DisplayMirror, ForegroundPresence, FrameBufferPool, InterruptHandle, MirrorHandle,
    PoolStats,
};
use mirrorsnap_core::{
    AuthorizationToken, CaptureConfig, CaptureError, CaptureResult, EncodedArtifact, SessionId,
    StridePolicy, TerminationReason,
};
use tracing::{debug, info, warn};

use crate::encoder::JpegEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Begun,
    Ended,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Begun => write!(f, "begun"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Everything that is alive only between `begin` and `end`.
struct Live {
    pool:      FrameBufferPool,
    mirror:    Box<dyn MirrorHandle>,
    interrupt: InterruptHandle,
}

struct SessionInner {
    phase: SessionPhase,
    live:  Option<Live>,
}

pub struct CaptureSession {
    id:            SessionId,
    config:        CaptureConfig,
    stride_policy: StridePolicy,
    encoder:       JpegEncoder,
    backend:       Arc<dyn DisplayMirror>,
    presence:      Arc<dyn ForegroundPresence>,
    inner:         Mutex<SessionInner>,
    captures:      AtomicU64,
}

impl CaptureSession {
    pub fn new(
        id: SessionId,
        config: CaptureConfig,
        stride_policy: StridePolicy,
        encoder: JpegEncoder,
        backend: Arc<dyn DisplayMirror>,
        presence: Arc<dyn ForegroundPresence>,
    ) -> Self {
        Self {
            id,
            config,
            stride_policy,
            encoder,
            backend,
            presence,
            inner: Mutex::new(SessionInner { phase: SessionPhase::Created, live: None }),
            captures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    pub fn is_begun(&self) -> bool {
        self.phase() == SessionPhase::Begun
    }

    /// Consume `token`, register foreground presence, create the pool and
    /// the mirror, and start streaming.
    ///
    /// `on_interrupt` runs (once, on the platform's thread) if the platform
    /// later ends the mirror on its own. On any failure the partially built
    /// resources are released and the session is `Ended`; it cannot be
    /// begun again.
    pub async fn begin<F>(&self, token: AuthorizationToken, on_interrupt: F) -> CaptureResult<()>
    where
        F: Fn(TerminationReason) + Send + Sync + 'static,
    {
        let phase = self.phase();
        if phase != SessionPhase::Created {
            self.backend.discard_token(token);
            return Err(CaptureError::invalid_state("begin", format_args!("session {phase}")));
        }
        if let Err(e) = self.config.validate() {
            self.backend.discard_token(token);
            self.lock().phase = SessionPhase::Ended;
            return Err(e);
        }
        if let Err(e) = self.presence.register(self.id) {
            warn!("Session[{}] foreground presence refused: {}", self.id, e);
            self.backend.discard_token(token);
            self.lock().phase = SessionPhase::Ended;
            return Err(match e {
                CaptureError::Resource { .. } => e,
                other => CaptureError::resource(other.to_string()),
            });
        }

        let pool = FrameBufferPool::new(self.config.buffer_slots);
        let interrupt = InterruptHandle::new(pool.clone(), on_interrupt);

        let created = self
            .backend
            .create_mirror(token, &self.config, pool.producer(), interrupt.clone())
            .await;
        let mut mirror = match created {
            Ok(m) => m,
            Err(e) => {
                warn!("Session[{}] mirror creation failed: {}", self.id, e);
                unwind(&pool, &interrupt, None);
                self.presence.withdraw(self.id);
                self.lock().phase = SessionPhase::Ended;
                return Err(e);
            }
        };

        if let Err(e) = mirror.start() {
            warn!("Session[{}] mirror start failed: {}", self.id, e);
            unwind(&pool, &interrupt, Some(mirror));
            self.presence.withdraw(self.id);
            self.lock().phase = SessionPhase::Ended;
            return Err(e);
        }

        let mut inner = self.lock();
        inner.live = Some(Live { pool, mirror, interrupt });
        inner.phase = SessionPhase::Begun;
        info!(
            "Session[{}] begun {}x{} {:?} slots={} stride={:?}",
            self.id,
            self.config.width,
            self.config.height,
            self.config.pixel_format,
            self.config.buffer_slots,
            self.stride_policy
        );
        Ok(())
    }

    /// Grab the newest committed frame and encode it.
    ///
    /// `Ok(None)` when the display has not produced a frame yet (or the
    /// platform already tore the mirror down); `InvalidState` outside
    /// `Begun`.
    pub fn capture_once(&self) -> CaptureResult<Option<EncodedArtifact>> {
        let inner = self.lock();
        let pool = match (inner.phase, inner.live.as_ref()) {
            (SessionPhase::Begun, Some(live)) => live.pool.clone(),
            (phase, _) => {
                return Err(CaptureError::invalid_state(
                    "capture_once",
                    format_args!("session {phase}"),
                ))
            }
        };
        drop(inner);

        let Some(frame) = pool.acquire_latest() else {
            debug!("Session[{}] no frame committed yet", self.id);
            return Ok(None);
        };
        let packed = correct(&frame, self.stride_policy);
        pool.release(frame);
        let packed = packed?;

        let mut artifact = self.encoder.encode(&packed)?;
        artifact.session_id = Some(self.id);
        artifact.sequence = self.captures.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Session[{}] capture #{} {}x{} → {} bytes",
            self.id,
            artifact.sequence,
            artifact.width,
            artifact.height,
            artifact.len()
        );
        Ok(Some(artifact))
    }

    /// Run `deliver` only while the session is `Begun`. The session lock is
    /// held for the call, so `end()` cannot complete in between; `None`
    /// means the session had already ended and `deliver` was not called.
    pub fn while_begun<R>(&self, deliver: impl FnOnce() -> R) -> Option<R> {
        let inner = self.lock();
        if inner.phase != SessionPhase::Begun {
            return None;
        }
        let result = deliver();
        drop(inner);
        Some(result)
    }

    /// Release the mirror and the pool and withdraw presence. Idempotent.
    pub fn end(&self) {
        let live = {
            let mut inner = self.lock();
            if inner.phase == SessionPhase::Ended {
                return;
            }
            inner.phase = SessionPhase::Ended;
            inner.live.take()
        };

        if let Some(Live { pool, mirror, interrupt }) = live {
            let stats = pool.stats();
            unwind(&pool, &interrupt, Some(mirror));
            self.presence.withdraw(self.id);
            info!(
                "Session[{}] ended after {} capture(s) (frames committed={} dropped={})",
                self.id,
                self.captures.load(Ordering::Relaxed),
                stats.committed,
                stats.dropped
            );
        } else {
            debug!("Session[{}] ended before it began", self.id);
        }
    }

    /// Pool counters; `None` unless begun.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.lock().live.as_ref().map(|l| l.pool.stats())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.end();
    }
}

/// Tear down in reverse order of construction. The interrupt is disarmed
/// first so releasing the mirror cannot report a platform termination.
fn unwind(pool: &FrameBufferPool, interrupt: &InterruptHandle, mirror: Option<Box<dyn MirrorHandle>>) {
    interrupt.disarm();
    if let Some(mut mirror) = mirror {
        mirror.release();
    }
    pool.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorsnap_capture::{Authorizer, LoggedPresence, SyntheticDisplay};
    use std::sync::atomic::AtomicUsize;

    fn session(display: &SyntheticDisplay, id: u64) -> CaptureSession {
        CaptureSession::new(
            SessionId(id),
            CaptureConfig::default(),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            Arc::new(LoggedPresence),
        )
    }

    /// Counts live registrations; refuses when `refuse` is set.
    #[derive(Default)]
    struct CountingPresence {
        live:   AtomicUsize,
        refuse: bool,
    }

    impl ForegroundPresence for CountingPresence {
        fn register(&self, _session: SessionId) -> CaptureResult<()> {
            if self.refuse {
                return Err(CaptureError::resource("notification channel disabled"));
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn withdraw(&self, _session: SessionId) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn capture_lifecycle() {
        let display = SyntheticDisplay::new();
        let s = session(&display, 1);
        assert_eq!(s.phase(), SessionPhase::Created);
        assert!(matches!(s.capture_once(), Err(CaptureError::InvalidState { .. })));

        let token = display.request_authorization().await.unwrap();
        s.begin(token, |_| {}).await.unwrap();
        assert!(s.is_begun());
        assert_eq!(display.live_mirrors(), 1);

        assert!(s.capture_once().unwrap().is_none());
        assert!(display.commit_solid([255, 0, 0, 255]));
        let artifact = s.capture_once().unwrap().expect("artifact");
        assert_eq!((artifact.width, artifact.height), (100, 200));
        assert_eq!(artifact.session_id, Some(SessionId(1)));
        assert_eq!(artifact.sequence, 1);

        // The frame was consumed.
        assert!(s.capture_once().unwrap().is_none());

        s.end();
        s.end();
        assert_eq!(s.phase(), SessionPhase::Ended);
        assert_eq!(display.live_mirrors(), 0);
        assert!(matches!(s.capture_once(), Err(CaptureError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn padded_frames_are_cropped() {
        let display = SyntheticDisplay::new().with_row_padding(64);
        let s = session(&display, 2);
        s.begin(display.request_authorization().await.unwrap(), |_| {}).await.unwrap();
        assert!(display.commit_pattern(3));
        let artifact = s.capture_once().unwrap().unwrap();
        assert_eq!(artifact.width, 100);
    }

    #[tokio::test]
    async fn failed_begin_unwinds_and_cannot_retry() {
        let display = SyntheticDisplay::new();
        display.fail_next_start("display asleep");
        let s = session(&display, 3);

        let err = s.begin(display.request_authorization().await.unwrap(), |_| {}).await;
        assert!(matches!(err, Err(CaptureError::Resource { .. })));
        assert_eq!(s.phase(), SessionPhase::Ended);
        assert_eq!(display.live_mirrors(), 0);

        let retry = s.begin(display.request_authorization().await.unwrap(), |_| {}).await;
        assert!(matches!(retry, Err(CaptureError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn rejected_token_leaves_no_mirror() {
        let display = SyntheticDisplay::new();
        let s = session(&display, 4);
        let err = s.begin(AuthorizationToken::new(999), |_| {}).await;
        assert!(matches!(err, Err(CaptureError::Authorization { .. })));
        assert_eq!(display.live_mirrors(), 0);
        assert!(s.pool_stats().is_none());
    }

    #[tokio::test]
    async fn platform_interrupt_notifies_and_stops_serving_frames() {
        let display = SyntheticDisplay::new();
        let s = session(&display, 5);
        let notified = Arc::new(AtomicUsize::new(0));
        let n = Arc::clone(&notified);
        s.begin(display.request_authorization().await.unwrap(), move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert!(display.commit_solid([1, 1, 1, 255]));
        assert_eq!(display.revoke(TerminationReason::Revoked), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        // Still begun until the owner calls end(), but nothing is served.
        assert!(s.capture_once().unwrap().is_none());

        s.end();
        assert_eq!(display.revoke(TerminationReason::Revoked), 0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_end_does_not_report_interrupt() {
        let display = SyntheticDisplay::new();
        let s = session(&display, 6);
        s.begin(display.request_authorization().await.unwrap(), |_| panic!("no interrupt on end"))
            .await
            .unwrap();
        s.end();
        assert_eq!(display.revoke(TerminationReason::DisplayChanged), 0);
    }

    #[tokio::test]
    async fn presence_follows_the_session() {
        let display = SyntheticDisplay::new();
        let presence = Arc::new(CountingPresence::default());
        let s = CaptureSession::new(
            SessionId(7),
            CaptureConfig::default(),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            presence.clone(),
        );
        s.begin(display.request_authorization().await.unwrap(), |_| {}).await.unwrap();
        assert_eq!(presence.live.load(Ordering::SeqCst), 1);
        s.end();
        assert_eq!(presence.live.load(Ordering::SeqCst), 0);

        display.fail_next_start("no surface");
        let failed = CaptureSession::new(
            SessionId(8),
            CaptureConfig::default(),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            presence.clone(),
        );
        assert!(failed.begin(display.request_authorization().await.unwrap(), |_| {}).await.is_err());
        assert_eq!(presence.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delivery_is_skipped_once_ended() {
        let display = SyntheticDisplay::new();
        let s = session(&display, 10);
        assert_eq!(s.while_begun(|| 1), None);

        s.begin(display.request_authorization().await.unwrap(), |_| {}).await.unwrap();
        assert_eq!(s.while_begun(|| 2), Some(2));

        s.end();
        assert_eq!(s.while_begun(|| 3), None);
    }

    #[tokio::test]
    async fn end_waits_for_delivery_in_progress() {
        let display = SyntheticDisplay::new();
        let s = Arc::new(session(&display, 11));
        s.begin(display.request_authorization().await.unwrap(), |_| {}).await.unwrap();

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let delivered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let delivering = {
            let s = Arc::clone(&s);
            let delivered = Arc::clone(&delivered);
            std::thread::spawn(move || {
                s.while_begun(|| {
                    entered_tx.send(()).unwrap();
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    delivered.store(true, Ordering::SeqCst);
                })
            })
        };
        entered_rx.recv().unwrap();
        s.end();
        assert!(delivered.load(Ordering::SeqCst), "end() returned during delivery");
        assert_eq!(delivering.join().unwrap(), Some(()));
        assert_eq!(s.phase(), SessionPhase::Ended);
    }

    #[tokio::test]
    async fn early_failures_give_the_token_back() {
        let display = SyntheticDisplay::new();
        let s = CaptureSession::new(
            SessionId(12),
            CaptureConfig::default(),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            Arc::new(CountingPresence { refuse: true, ..Default::default() }),
        );
        assert!(s.begin(display.request_authorization().await.unwrap(), |_| {}).await.is_err());
        assert_eq!(display.outstanding_tokens(), 0);

        let bad_geometry = CaptureSession::new(
            SessionId(13),
            CaptureConfig::new(0, 0),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            Arc::new(LoggedPresence),
        );
        let err = bad_geometry.begin(display.request_authorization().await.unwrap(), |_| {}).await;
        assert!(matches!(err, Err(CaptureError::Config { .. })));
        assert_eq!(display.outstanding_tokens(), 0);

        // A second begin on an ended session also returns its token.
        assert!(bad_geometry.begin(display.request_authorization().await.unwrap(), |_| {}).await.is_err());
        assert_eq!(display.outstanding_tokens(), 0);
    }

    #[tokio::test]
    async fn refused_presence_is_a_resource_error() {
        let display = SyntheticDisplay::new();
        let s = CaptureSession::new(
            SessionId(9),
            CaptureConfig::default(),
            StridePolicy::Crop,
            JpegEncoder::default(),
            Arc::new(display.clone()),
            Arc::new(CountingPresence { refuse: true, ..Default::default() }),
        );
        let err = s.begin(display.request_authorization().await.unwrap(), |_| {}).await;
        assert!(matches!(err, Err(CaptureError::Resource { .. })));
        assert_eq!(display.live_mirrors(), 0);
        assert_eq!(s.phase(), SessionPhase::Ended);
    }
}
