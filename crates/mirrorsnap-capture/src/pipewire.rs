//! PipeWire screen-cast backend (XDG desktop portal + GStreamer).
//!
//! ```text
//! PortalAuthorizer: ashpd ScreenCast ──► PipeWire node_id + remote fd
//!                                               │  (token grant)
//!                                               ▼
//! PipeWireMirror:  pipewiresrc(fd=X, path=Y)
//!                        │
//!                   videoconvert ! videoscale
//!                        │
//!                video/x-raw,format=RGBA,width=W,height=H
//!                        │
//!                     appsink ─────► FrameProducer (stride from caps)
//! ```
//!
//! Bus EOS / error messages fire the session's interrupt. The portal session
//! and the remote fd stay with the grant until the mirror is released, or
//! until the grant is dropped unredeemed.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use ashpd::desktop::screencast::{CursorMode, PersistMode, Screencast, SourceType};
use ashpd::desktop::Session;
use ashpd::WindowIdentifier;
use async_trait::async_trait;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};
use mirrorsnap_core::{
    AuthorizationToken, CaptureConfig, CaptureError, CaptureResult, TerminationReason,
};
use tracing::{debug, error, info, warn};

use crate::backend::{Authorizer, DisplayMirror, MirrorHandle};
use crate::interrupt::InterruptHandle;
use crate::pool::{FrameGeometry, FrameProducer};

type PortalSession = Session<'static, Screencast<'static>>;

/// What the portal handed out; travels inside the token.
struct PortalGrant {
    node_id: u32,
    portal:  PortalResources,
}

/// Remote fd plus the portal session that backs it. Both are given back on
/// [`PortalResources::release`] or on drop.
struct PortalResources {
    fd:      Option<OwnedFd>,
    session: Option<PortalSession>,
}

impl PortalResources {
    fn raw_fd(&self) -> Option<i32> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn release(&mut self) {
        if self.fd.take().is_some() {
            debug!("PipeWire remote fd closed");
        }
        if let Some(session) = self.session.take() {
            close_session(session);
        }
    }
}

impl Drop for PortalResources {
    fn drop(&mut self) {
        self.release();
    }
}

/// ashpd sessions have no Drop; the portal keeps them until `Close` is called.
fn close_session(session: PortalSession) {
    let close = async move {
        match session.close().await {
            Ok(()) => debug!("Portal session closed"),
            Err(e) => warn!("Portal session close failed: {}", e),
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(close);
        }
        Err(_) => match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(close),
            Err(e) => warn!("Portal session left open: {}", e),
        },
    }
}

// ── Authorizer ────────────────────────────────────────────────────────────────

/// Asks the desktop portal for a monitor stream. On Wayland this shows the
/// compositor's screen-share dialog.
#[derive(Debug, Default)]
pub struct PortalAuthorizer {
    next_id: AtomicU64,
}

#[async_trait]
impl Authorizer for PortalAuthorizer {
    async fn request_authorization(&self) -> CaptureResult<AuthorizationToken> {
        let grant = negotiate_portal()
            .await
            .map_err(|e| CaptureError::authorization(format!("{e:#}")))?;
        info!(
            "PipeWire portal ok: node_id={} fd={:?}",
            grant.node_id,
            grant.portal.raw_fd()
        );

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AuthorizationToken::new(id).with_grant(grant))
    }
}

/// Opens a portal session for the first monitor stream. The session is
/// closed again if any later step fails.
async fn negotiate_portal() -> anyhow::Result<PortalGrant> {
    let proxy = Screencast::new().await.context("ScreenCast portal")?;
    let session: PortalSession = proxy.create_session().await.context("create_session")?;

    match open_stream(&proxy, &session).await {
        Ok((node_id, fd)) => Ok(PortalGrant {
            node_id,
            portal: PortalResources { fd: Some(fd), session: Some(session) },
        }),
        Err(e) => {
            if let Err(close) = session.close().await {
                warn!("Portal session close failed: {}", close);
            }
            Err(e)
        }
    }
}

/// Returns `(node_id, remote fd)`.
async fn open_stream(
    proxy: &Screencast<'static>,
    session: &PortalSession,
) -> anyhow::Result<(u32, OwnedFd)> {
    proxy
        .select_sources(
            session,
            CursorMode::Embedded,
            SourceType::Monitor.into(),
            false, // multiple
            None,  // restore token
            PersistMode::DoNot,
        )
        .await
        .context("select_sources")?;

    let response = proxy
        .start(session, &WindowIdentifier::default())
        .await
        .context("portal start")?
        .response()
        .context("portal denied")?;

    let stream = response
        .streams()
        .first()
        .context("No PipeWire streams returned by portal")?;
    let node_id = stream.pipe_wire_node_id();

    let fd = proxy
        .open_pipe_wire_remote(session)
        .await
        .context("open_pipe_wire_remote")?;

    Ok((node_id, fd))
}

// ── Mirror ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PipeWireMirror;

#[async_trait]
impl DisplayMirror for PipeWireMirror {
    async fn create_mirror(
        &self,
        mut token: AuthorizationToken,
        config: &CaptureConfig,
        producer: FrameProducer,
        interrupt: InterruptHandle,
    ) -> CaptureResult<Box<dyn MirrorHandle>> {
        if token.is_expired() {
            return Err(CaptureError::authorization("portal grant expired"));
        }
        let PortalGrant { node_id, portal } = token
            .take_grant::<PortalGrant>()
            .ok_or_else(|| CaptureError::authorization("token carries no portal grant"))?;
        let fd = portal
            .raw_fd()
            .ok_or_else(|| CaptureError::authorization("portal grant already released"))?;

        // On any error below `portal` drops and gives the session back.
        gstreamer::init().map_err(|e| CaptureError::resource(format!("GStreamer init: {e}")))?;
        let pipeline = build_pipeline(config, fd, node_id, producer)
            .map_err(|e| CaptureError::resource(format!("{e:#}")))?;

        Ok(Box::new(PipeWireHandle {
            pipeline,
            portal,
            interrupt,
            stopping: Arc::new(AtomicBool::new(false)),
            bus_watcher: None,
            released: false,
        }))
    }
}

fn build_pipeline(
    config: &CaptureConfig,
    fd: i32,
    node_id: u32,
    producer: FrameProducer,
) -> anyhow::Result<gstreamer::Pipeline> {
    let w = config.width;
    let h = config.height;
    let slots = config.buffer_slots;

    let desc = format!(
        "pipewiresrc fd={fd} path={node_id} do-timestamp=true \
         ! videoconvert \
         ! videoscale \
         ! video/x-raw,format=RGBA,width={w},height={h} \
         ! appsink name=sink max-buffers={slots} drop=true sync=false emit-signals=false"
    );
    debug!("GStreamer pipeline: {}", desc);

    let pipeline = gstreamer::parse::launch(&desc)
        .context("Parsing GStreamer pipeline")?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow::anyhow!("Expected Pipeline element"))?;

    let appsink: AppSink = pipeline
        .by_name("sink")
        .context("Finding appsink 'sink'")?
        .downcast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("Expected AppSink"))?;

    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gstreamer::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gstreamer::FlowError::Error)?;
                let caps = sample.caps().ok_or(gstreamer::FlowError::Error)?;
                let info = gstreamer_video::VideoInfo::from_caps(caps)
                    .map_err(|_| gstreamer::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gstreamer::FlowError::Error)?;

                let geometry = FrameGeometry {
                    row_stride_bytes: info.stride()[0].max(0) as u32,
                    pixel_stride_bytes: 4,
                    width: info.width(),
                    height: info.height(),
                };
                if !producer.commit_bytes(geometry, map.as_slice()) {
                    if producer.is_closed() {
                        return Err(gstreamer::FlowError::Flushing);
                    }
                    debug!("Frame dropped: every pool slot busy");
                }
                Ok(gstreamer::FlowSuccess::Ok)
            })
            .build(),
    );

    Ok(pipeline)
}

struct PipeWireHandle {
    pipeline:    gstreamer::Pipeline,
    // Outlives the pipeline's use of the fd.
    portal:      PortalResources,
    interrupt:   InterruptHandle,
    stopping:    Arc<AtomicBool>,
    bus_watcher: Option<JoinHandle<()>>,
    released:    bool,
}

impl MirrorHandle for PipeWireHandle {
    fn start(&mut self) -> CaptureResult<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| CaptureError::resource(format!("GStreamer set Playing: {e}")))?;

        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| CaptureError::resource("pipeline has no bus"))?;
        let stopping = Arc::clone(&self.stopping);
        let interrupt = self.interrupt.clone();

        // Watch the bus for errors / EOS until released.
        let watcher = std::thread::Builder::new()
            .name("pipewire-bus".into())
            .spawn(move || {
                while !stopping.load(Ordering::Acquire) {
                    let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(250)) else {
                        continue;
                    };
                    match msg.view() {
                        gstreamer::MessageView::Eos(_) => {
                            info!("GStreamer pipeline EOS");
                            interrupt.interrupt(TerminationReason::StreamEnded);
                            break;
                        }
                        gstreamer::MessageView::Error(e) => {
                            error!("GStreamer error: {}", e.error());
                            interrupt.interrupt(TerminationReason::StreamError(e.error().to_string()));
                            break;
                        }
                        _ => {}
                    }
                }
            })
            .map_err(|e| CaptureError::resource(format!("bus watcher thread: {e}")))?;
        self.bus_watcher = Some(watcher);

        info!("PipeWire mirror streaming");
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stopping.store(true, Ordering::Release);
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        if let Some(watcher) = self.bus_watcher.take() {
            let _ = watcher.join();
        }
        self.portal.release();
        debug!("PipeWire mirror released");
    }
}

impl Drop for PipeWireHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{ErrorKind, Read};
    use std::os::unix::net::UnixStream;

    /// A connected pair whose far end reports EOF once `fd` is closed.
    fn remote_fd() -> (OwnedFd, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        peer.set_nonblocking(true).unwrap();
        (OwnedFd::from(ours), peer)
    }

    fn is_closed(peer: &mut UnixStream) -> bool {
        let mut buf = [0u8; 1];
        match peer.read(&mut buf) {
            Ok(0) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            other => panic!("unexpected read result: {other:?}"),
        }
    }

    #[test]
    fn release_closes_remote_fd_once() {
        let (fd, mut peer) = remote_fd();
        let mut portal = PortalResources { fd: Some(fd), session: None };
        assert!(portal.raw_fd().is_some());
        assert!(!is_closed(&mut peer));

        portal.release();
        assert!(portal.raw_fd().is_none());
        assert!(is_closed(&mut peer));
        portal.release();
    }

    #[test]
    fn unredeemed_grant_closes_fd_with_the_token() {
        let (fd, mut peer) = remote_fd();
        let token = AuthorizationToken::new(1).with_grant(PortalGrant {
            node_id: 42,
            portal:  PortalResources { fd: Some(fd), session: None },
        });
        assert!(!is_closed(&mut peer));

        PipeWireMirror.discard_token(token);
        assert!(is_closed(&mut peer));
    }
}
