//! `SessionController`: single-writer actor that owns the session slot.
//!
//! ```text
//! ControllerHandle ──Command──► mpsc (unbounded) ──► actor task
//!        ▲                                              │
//!        │                   watch<bool> running ◄──────┤
//!        │                   watch<SessionState> ◄──────┤
//!        │                                              │
//!   InterruptHandle listener ──SessionDied──────────────┘ (weak sender)
//! ```
//!
//! Commands are applied strictly in arrival order. `start` and `stop`
//! complete inside the actor; `snapshot` is handed to the blocking pool so a
//! slow encode never holds up a `stop` queued behind it.

use std::sync::Arc;

use mirrorsnap_capture::{
    Authorizer, DisplayMirror, ForegroundPresence, LoggedPresence, PoolStats, SyntheticDisplay,
};
use mirrorsnap_core::{
    CaptureConfig, CaptureError, CaptureResult, EncodedArtifact, SessionId, SessionState,
    StridePolicy, TerminationReason,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::encoder::JpegEncoder;
use crate::session::CaptureSession;
use crate::sink::ArtifactSink;

// ── Wiring ────────────────────────────────────────────────────────────────────

/// The platform services a session needs.
#[derive(Clone)]
pub struct Platform {
    pub authorizer: Arc<dyn Authorizer>,
    pub mirror:     Arc<dyn DisplayMirror>,
    pub presence:   Arc<dyn ForegroundPresence>,
}

impl Platform {
    /// Synthetic display in both roles, presence announced in the log.
    pub fn synthetic(display: &SyntheticDisplay) -> Self {
        Self {
            authorizer: Arc::new(display.clone()),
            mirror:     Arc::new(display.clone()),
            presence:   Arc::new(LoggedPresence),
        }
    }
}

/// Per-session parameters, fixed for the controller's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub capture:       CaptureConfig,
    pub stride_policy: StridePolicy,
    pub encoder:       JpegEncoder,
}

// ── Replies ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SessionId),
    /// A session was already active; nothing changed.
    AlreadyRunning(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(SessionId),
    AlreadyIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state:            SessionState,
    pub session:          Option<SessionId>,
    /// Why the most recent session ended without a `stop`, if it did.
    pub last_termination: Option<TerminationReason>,
    pub pool:             Option<PoolStats>,
}

enum Command {
    Start { reply: oneshot::Sender<CaptureResult<StartOutcome>> },
    Stop { reply: oneshot::Sender<StopOutcome> },
    Snapshot { reply: oneshot::Sender<CaptureResult<Option<EncodedArtifact>>> },
    Status { reply: oneshot::Sender<ControllerStatus> },
    SessionDied { id: SessionId, reason: TerminationReason },
    Shutdown { reply: oneshot::Sender<()> },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable command interface. The actor exits once every handle is
/// dropped or [`ControllerHandle::shutdown`] is called.
#[derive(Clone)]
pub struct ControllerHandle {
    tx:      mpsc::UnboundedSender<Command>,
    running: watch::Receiver<bool>,
    state:   watch::Receiver<SessionState>,
}

impl ControllerHandle {
    pub async fn start(&self) -> CaptureResult<StartOutcome> {
        self.request(|reply| Command::Start { reply }).await?
    }

    pub async fn stop(&self) -> CaptureResult<StopOutcome> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// `Ok(None)` when no session is active or no frame has arrived yet.
    pub async fn snapshot(&self) -> CaptureResult<Option<EncodedArtifact>> {
        self.request(|reply| Command::Snapshot { reply }).await?
    }

    pub async fn status(&self) -> CaptureResult<ControllerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// End any active session and stop the actor.
    pub async fn shutdown(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Level-triggered running flag; a new receiver sees the current value.
    pub fn running(&self) -> watch::Receiver<bool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn states(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> CaptureResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CaptureError::ControllerClosed)?;
        rx.await.map_err(|_| CaptureError::ControllerClosed)
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

pub struct SessionController {
    platform: Platform,
    settings: SessionSettings,
    sink:     Arc<dyn ArtifactSink>,
    // Weak so that dropping every handle ends the actor.
    weak_tx:  mpsc::WeakUnboundedSender<Command>,
    running:  watch::Sender<bool>,
    state:    watch::Sender<SessionState>,
    active:   Option<Arc<CaptureSession>>,
    next_id:  u64,
    last_termination: Option<TerminationReason>,
}

impl SessionController {
    /// Spawn the actor on the current runtime.
    pub fn spawn(
        platform: Platform,
        settings: SessionSettings,
        sink: Arc<dyn ArtifactSink>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let actor = Self {
            platform,
            settings,
            sink,
            weak_tx: tx.downgrade(),
            running: running_tx,
            state: state_tx,
            active: None,
            next_id: 1,
            last_termination: None,
        };
        let task = tokio::spawn(actor.run(rx));

        let handle = ControllerHandle { tx, running: running_rx, state: state_rx };
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("Session controller ready");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Start { reply } => {
                    let result = self.handle_start().await;
                    let _ = reply.send(result);
                }
                Command::Stop { reply } => {
                    let outcome = self.handle_stop().await;
                    let _ = reply.send(outcome);
                }
                Command::Snapshot { reply } => self.handle_snapshot(reply),
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::SessionDied { id, reason } => self.handle_session_died(id, reason).await,
                Command::Shutdown { reply } => {
                    self.teardown().await;
                    let _ = reply.send(());
                    info!("Session controller shut down");
                    return;
                }
            }
        }
        self.teardown().await;
        debug!("Session controller: all handles dropped");
    }

    // ── start ─────────────────────────────────────────────────────────────────

    async fn handle_start(&mut self) -> CaptureResult<StartOutcome> {
        if let Some(active) = &self.active {
            warn!("start ignored: session {} is already active", active.id());
            return Ok(StartOutcome::AlreadyRunning(active.id()));
        }

        self.set_state(SessionState::Starting);
        match self.open_session().await {
            Ok(session) => {
                let id = session.id();
                self.active = Some(session);
                self.last_termination = None;
                self.set_state(SessionState::Active);
                self.set_running(true);
                info!("Session {} active", id);
                Ok(StartOutcome::Started(id))
            }
            Err(e) => {
                error!("start failed: {}", e);
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    async fn open_session(&mut self) -> CaptureResult<Arc<CaptureSession>> {
        // Fail before the consent prompt if the geometry is unusable.
        self.settings.capture.validate()?;

        let token = self.platform.authorizer.request_authorization().await?;
        debug!("Authorization granted: {:?}", token);

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let session = Arc::new(CaptureSession::new(
            id,
            self.settings.capture.clone(),
            self.settings.stride_policy,
            self.settings.encoder,
            Arc::clone(&self.platform.mirror),
            Arc::clone(&self.platform.presence),
        ));

        let weak_tx = self.weak_tx.clone();
        session
            .begin(token, move |reason| {
                if let Some(tx) = weak_tx.upgrade() {
                    let _ = tx.send(Command::SessionDied { id, reason });
                }
            })
            .await?;
        Ok(session)
    }

    // ── stop / death ──────────────────────────────────────────────────────────

    async fn handle_stop(&mut self) -> StopOutcome {
        match self.end_active().await {
            Some(id) => {
                info!("Session {} stopped", id);
                StopOutcome::Stopped(id)
            }
            None => {
                debug!("stop ignored: no active session");
                StopOutcome::AlreadyIdle
            }
        }
    }

    async fn handle_session_died(&mut self, id: SessionId, reason: TerminationReason) {
        let current = self.active.as_ref().is_some_and(|s| s.id() == id);
        if !current {
            debug!("Stale termination for session {} ignored ({})", id, reason);
            return;
        }
        warn!("Session {} terminated by platform: {}", id, reason);
        self.end_active().await;
        self.last_termination = Some(reason);
    }

    /// `Active → Stopping → Idle`. Returns the id of the ended session.
    async fn end_active(&mut self) -> Option<SessionId> {
        let session = self.active.take()?;
        let id = session.id();

        self.set_state(SessionState::Stopping);
        // Releasing the mirror may join platform threads.
        let ended = tokio::task::spawn_blocking(move || session.end()).await;
        if let Err(e) = ended {
            error!("Session {} teardown panicked: {}", id, e);
        }
        self.set_state(SessionState::Idle);
        self.set_running(false);
        Some(id)
    }

    async fn teardown(&mut self) {
        if let Some(id) = self.end_active().await {
            info!("Session {} ended on controller shutdown", id);
        }
    }

    // ── snapshot ──────────────────────────────────────────────────────────────

    fn handle_snapshot(&self, reply: oneshot::Sender<CaptureResult<Option<EncodedArtifact>>>) {
        let Some(session) = self.active.clone() else {
            debug!("snapshot ignored: no active session");
            let _ = reply.send(Ok(None));
            return;
        };
        let sink = Arc::clone(&self.sink);

        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || capture_and_deliver(&session, &*sink))
                .await
                .unwrap_or_else(|e| {
                    error!("Snapshot task failed: {}", e);
                    Err(CaptureError::task_failed(e.to_string()))
                });
            let _ = reply.send(result);
        });
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state:            *self.state.borrow(),
            session:          self.active.as_ref().map(|s| s.id()),
            last_termination: self.last_termination.clone(),
            pool:             self.active.as_ref().and_then(|s| s.pool_stats()),
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state {} → {}", previous, state);
        }
    }

    fn set_running(&self, running: bool) {
        self.running.send_if_modified(|current| {
            let changed = *current != running;
            *current = running;
            changed
        });
    }
}

/// Runs on the blocking pool.
fn capture_and_deliver(
    session: &CaptureSession,
    sink: &dyn ArtifactSink,
) -> CaptureResult<Option<EncodedArtifact>> {
    let Some(artifact) = session.capture_once()? else {
        return Ok(None);
    };
    let delivered = session.while_begun(|| {
        if let Err(e) = sink.deliver(&artifact) {
            warn!("Artifact sink failed: {:#}", e);
        }
    });
    if delivered.is_none() {
        debug!("Session {} ended during capture; artifact discarded", session.id());
        return Ok(None);
    }
    Ok(Some(artifact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;

    fn spawn(display: &SyntheticDisplay) -> (ControllerHandle, mpsc::UnboundedReceiver<EncodedArtifact>) {
        let (sink, rx) = ChannelSink::new();
        let (handle, _task) =
            SessionController::spawn(Platform::synthetic(display), SessionSettings::default(), Arc::new(sink));
        (handle, rx)
    }

    #[tokio::test]
    async fn start_then_start_is_a_noop() {
        let display = SyntheticDisplay::new();
        let (ctl, _rx) = spawn(&display);

        let first = ctl.start().await.unwrap();
        assert_eq!(first, StartOutcome::Started(SessionId(1)));
        assert_eq!(ctl.start().await.unwrap(), StartOutcome::AlreadyRunning(SessionId(1)));
        assert_eq!(display.authorizations_issued(), 1);
        assert_eq!(display.live_mirrors(), 1);
        assert_eq!(ctl.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn stop_when_idle_leaves_running_untouched() {
        let display = SyntheticDisplay::new();
        let (ctl, _rx) = spawn(&display);
        let mut running = ctl.running();
        running.borrow_and_update();

        assert_eq!(ctl.stop().await.unwrap(), StopOutcome::AlreadyIdle);
        assert!(!running.has_changed().unwrap());
        assert!(!ctl.is_running());
    }

    #[tokio::test]
    async fn snapshot_delivers_to_sink_only_when_active() {
        let display = SyntheticDisplay::new();
        let (ctl, mut rx) = spawn(&display);

        assert!(ctl.snapshot().await.unwrap().is_none());
        ctl.start().await.unwrap();
        display.commit_solid([0, 128, 255, 255]);

        let artifact = ctl.snapshot().await.unwrap().expect("artifact");
        assert_eq!(artifact.session_id, Some(SessionId(1)));
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.bytes, artifact.bytes);

        ctl.stop().await.unwrap();
        assert!(ctl.snapshot().await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn denied_authorization_keeps_idle() {
        let display = SyntheticDisplay::new();
        display.deny_next_authorization("user pressed cancel");
        let (ctl, _rx) = spawn(&display);

        assert!(matches!(ctl.start().await, Err(CaptureError::Authorization { .. })));
        assert_eq!(ctl.state(), SessionState::Idle);
        assert!(!ctl.is_running());

        // Next attempt gets a fresh token.
        assert!(matches!(ctl.start().await, Ok(StartOutcome::Started(_))));
    }

    #[tokio::test]
    async fn invalid_geometry_fails_before_authorization() {
        let display = SyntheticDisplay::new();
        let settings = SessionSettings {
            capture: CaptureConfig::new(0, 10),
            ..Default::default()
        };
        let (ctl, _task) = SessionController::spawn(
            Platform::synthetic(&display),
            settings,
            Arc::new(crate::sink::LogSink::default()),
        );
        assert!(matches!(ctl.start().await, Err(CaptureError::Config { .. })));
        assert_eq!(display.authorizations_issued(), 0);
    }

    #[tokio::test]
    async fn platform_death_resets_and_records_reason() {
        let display = SyntheticDisplay::new();
        let (ctl, _rx) = spawn(&display);
        ctl.start().await.unwrap();

        let mut running = ctl.running();
        assert!(*running.borrow_and_update());
        display.revoke(TerminationReason::DisplayChanged);
        running.wait_for(|r| !*r).await.unwrap();

        let status = ctl.status().await.unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.session, None);
        assert_eq!(status.last_termination, Some(TerminationReason::DisplayChanged));
        assert_eq!(display.live_mirrors(), 0);
    }

    struct PanickingSink;

    impl ArtifactSink for PanickingSink {
        fn deliver(&self, _: &EncodedArtifact) -> anyhow::Result<()> {
            panic!("sink bug")
        }
    }

    #[tokio::test]
    async fn crashed_capture_task_is_reported_as_task_failure() {
        let display = SyntheticDisplay::new();
        let (ctl, _task) = SessionController::spawn(
            Platform::synthetic(&display),
            SessionSettings::default(),
            Arc::new(PanickingSink),
        );
        ctl.start().await.unwrap();
        display.commit_solid([9, 9, 9, 255]);

        assert!(matches!(ctl.snapshot().await, Err(CaptureError::TaskFailed { .. })));
        // The session survives a crashed snapshot and still stops cleanly.
        assert!(matches!(ctl.stop().await.unwrap(), StopOutcome::Stopped(_)));
        assert_eq!(display.live_mirrors(), 0);
    }

    #[tokio::test]
    async fn published_state_matches_mirror_ownership() {
        let display = SyntheticDisplay::new();
        let (ctl, _rx) = spawn(&display);
        let mut states = ctl.states();
        assert!(!states.borrow_and_update().holds_mirror());
        assert_eq!(display.live_mirrors(), 0);

        ctl.start().await.unwrap();
        assert!(states.has_changed().unwrap());
        let state = *states.borrow_and_update();
        assert_eq!(state, SessionState::Active);
        assert!(state.holds_mirror());
        assert_eq!(display.live_mirrors(), 1);

        ctl.stop().await.unwrap();
        let state = *states.borrow_and_update();
        assert_eq!(state, SessionState::Idle);
        assert!(!state.holds_mirror());
        assert_eq!(display.live_mirrors(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_session_and_closes_handle() {
        let display = SyntheticDisplay::new();
        let (sink, _rx) = ChannelSink::new();
        let (ctl, task) =
            SessionController::spawn(Platform::synthetic(&display), SessionSettings::default(), Arc::new(sink));
        ctl.start().await.unwrap();

        ctl.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(display.live_mirrors(), 0);
        assert!(!ctl.is_running());
        assert!(matches!(ctl.start().await, Err(CaptureError::ControllerClosed)));
    }

    #[tokio::test]
    async fn dropping_every_handle_ends_the_actor() {
        let display = SyntheticDisplay::new();
        let (sink, _rx) = ChannelSink::new();
        let (ctl, task) =
            SessionController::spawn(Platform::synthetic(&display), SessionSettings::default(), Arc::new(sink));
        ctl.start().await.unwrap();
        drop(ctl);
        task.await.unwrap();
        assert_eq!(display.live_mirrors(), 0);
    }
}
