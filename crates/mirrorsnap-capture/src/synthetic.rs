//! In-process display used when no platform backend is compiled in, and by
//! tests.
//!
//! It plays both platform roles: it issues and validates authorization
//! tokens, and it mirrors a fake display into the session's pool. The
//! producer side is driven either by explicit calls ([`SyntheticDisplay::commit_solid`],
//! [`SyntheticDisplay::commit_pattern`]) or by a painter thread started with
//! the mirror ([`SyntheticDisplay::with_painter`]). Failure modes of a real
//! platform (denied consent, exhausted display slots, start failure,
//! revocation) can be injected.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mirrorsnap_core::{
    AuthorizationToken, CaptureConfig, CaptureError, CaptureResult, TerminationReason,
};
use tracing::{debug, info, warn};

use crate::backend::{Authorizer, DisplayMirror, MirrorHandle};
use crate::interrupt::InterruptHandle;
use crate::pool::{FrameGeometry, FrameProducer};

struct LiveMirror {
    id:        u64,
    producer:  FrameProducer,
    interrupt: InterruptHandle,
    geometry:  FrameGeometry,
    started:   bool,
}

struct DisplayState {
    outstanding:   HashSet<u64>,
    deny_next:     Option<String>,
    fail_next_start: Option<String>,
    token_ttl:     Option<Duration>,
    display_slots: usize,
    row_padding_bytes: u32,
    paint_fps:     Option<u32>,
    mirrors:       Vec<LiveMirror>,
}

struct Shared {
    next_token:  AtomicU64,
    next_mirror: AtomicU64,
    issued:      AtomicU64,
    state:       Mutex<DisplayState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; clones control the same fake display.
#[derive(Clone)]
pub struct SyntheticDisplay {
    shared: Arc<Shared>,
}

impl Default for SyntheticDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDisplay {
    /// One display slot, no row padding, frames only on request.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_token: AtomicU64::new(1),
                next_mirror: AtomicU64::new(1),
                issued: AtomicU64::new(0),
                state: Mutex::new(DisplayState {
                    outstanding: HashSet::new(),
                    deny_next: None,
                    fail_next_start: None,
                    token_ttl: None,
                    display_slots: 1,
                    row_padding_bytes: 0,
                    paint_fps: None,
                    mirrors: Vec::new(),
                }),
            }),
        }
    }

    /// Paint a moving test pattern at `fps` while a mirror is started.
    pub fn with_painter(self, fps: u32) -> Self {
        self.shared.lock().paint_fps = Some(fps.max(1));
        self
    }

    /// Emulate platform row alignment: every row carries `bytes` of padding.
    pub fn with_row_padding(self, bytes: u32) -> Self {
        self.shared.lock().row_padding_bytes = bytes;
        self
    }

    /// The next authorization request is refused with `reason`.
    pub fn deny_next_authorization(&self, reason: impl Into<String>) {
        self.shared.lock().deny_next = Some(reason.into());
    }

    /// Tokens issued from now on expire after `ttl`.
    pub fn set_token_ttl(&self, ttl: Option<Duration>) {
        self.shared.lock().token_ttl = ttl;
    }

    /// How many mirrors may be live at once. Zero emulates exhausted slots.
    pub fn set_display_slots(&self, slots: usize) {
        self.shared.lock().display_slots = slots;
    }

    /// The next [`MirrorHandle::start`] fails with `reason`.
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        self.shared.lock().fail_next_start = Some(reason.into());
    }

    /// Number of mirrors currently bound to a pool.
    pub fn live_mirrors(&self) -> usize {
        self.shared.lock().mirrors.len()
    }

    /// Total tokens handed out.
    pub fn authorizations_issued(&self) -> u64 {
        self.shared.issued.load(Ordering::Relaxed)
    }

    /// Tokens issued but neither redeemed nor discarded.
    pub fn outstanding_tokens(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    /// Commit one frame filled with `rgba` into the started mirror.
    /// Returns `false` if no mirror is streaming or the pool dropped it.
    pub fn commit_solid(&self, rgba: [u8; 4]) -> bool {
        self.commit_with(|buf, geometry| paint_solid(buf, geometry, rgba))
    }

    /// Commit one test-pattern frame for animation step `tick`.
    pub fn commit_pattern(&self, tick: u32) -> bool {
        self.commit_with(|buf, geometry| paint_pattern(buf, geometry, tick))
    }

    fn commit_with<F>(&self, paint: F) -> bool
    where
        F: FnOnce(&mut [u8], FrameGeometry),
    {
        let target = {
            let state = self.shared.lock();
            state
                .mirrors
                .iter()
                .rev()
                .find(|m| m.started)
                .map(|m| (m.producer.clone(), m.geometry))
        };
        match target {
            Some((producer, geometry)) => producer.write_frame(geometry, |buf| paint(buf, geometry)),
            None => false,
        }
    }

    /// Terminate every live mirror from the platform side.
    /// Returns how many sessions were notified.
    pub fn revoke(&self, reason: TerminationReason) -> usize {
        let handles: Vec<InterruptHandle> = self
            .shared
            .lock()
            .mirrors
            .iter()
            .map(|m| m.interrupt.clone())
            .collect();
        handles
            .into_iter()
            .filter(|h| h.interrupt(reason.clone()))
            .count()
    }
}

#[async_trait]
impl Authorizer for SyntheticDisplay {
    async fn request_authorization(&self) -> CaptureResult<AuthorizationToken> {
        let mut state = self.shared.lock();
        if let Some(reason) = state.deny_next.take() {
            warn!("Synthetic display: authorization denied ({reason})");
            return Err(CaptureError::authorization(reason));
        }
        let id = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        state.outstanding.insert(id);
        self.shared.issued.fetch_add(1, Ordering::Relaxed);

        let token = AuthorizationToken::new(id);
        let token = match state.token_ttl {
            Some(ttl) => token.with_expiry(Instant::now() + ttl),
            None => token,
        };
        debug!("Synthetic display: issued token {id}");
        Ok(token)
    }
}

#[async_trait]
impl DisplayMirror for SyntheticDisplay {
    async fn create_mirror(
        &self,
        token: AuthorizationToken,
        config: &CaptureConfig,
        producer: FrameProducer,
        interrupt: InterruptHandle,
    ) -> CaptureResult<Box<dyn MirrorHandle>> {
        let mut state = self.shared.lock();

        // Whatever happens next, this token cannot be presented again.
        let known = state.outstanding.remove(&token.id());
        if !known {
            return Err(CaptureError::authorization(format!(
                "token {} unknown or already used",
                token.id()
            )));
        }
        if token.is_expired() {
            return Err(CaptureError::authorization(format!("token {} expired", token.id())));
        }
        if state.mirrors.len() >= state.display_slots {
            return Err(CaptureError::resource(format!(
                "no free display slot ({} in use)",
                state.mirrors.len()
            )));
        }

        let id = self.shared.next_mirror.fetch_add(1, Ordering::Relaxed);
        let geometry = FrameGeometry::rgba(config.width, config.height, state.row_padding_bytes);
        state.mirrors.push(LiveMirror {
            id,
            producer,
            interrupt,
            geometry,
            started: false,
        });
        info!(
            "Synthetic display: mirror {id} created {}x{} (stride {} bytes)",
            config.width, config.height, geometry.row_stride_bytes
        );

        Ok(Box::new(SyntheticMirrorHandle {
            shared: Arc::clone(&self.shared),
            id,
            painter: None,
            released: false,
        }))
    }

    fn discard_token(&self, token: AuthorizationToken) {
        if self.shared.lock().outstanding.remove(&token.id()) {
            debug!("Synthetic display: token {} discarded", token.id());
        }
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct Painter {
    stop:   Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct SyntheticMirrorHandle {
    shared:   Arc<Shared>,
    id:       u64,
    painter:  Option<Painter>,
    released: bool,
}

impl MirrorHandle for SyntheticMirrorHandle {
    fn start(&mut self) -> CaptureResult<()> {
        let mut state = self.shared.lock();
        if let Some(reason) = state.fail_next_start.take() {
            return Err(CaptureError::resource(reason));
        }
        let paint_fps = state.paint_fps;
        let Some(mirror) = state.mirrors.iter_mut().find(|m| m.id == self.id) else {
            return Err(CaptureError::resource(format!("mirror {} no longer exists", self.id)));
        };
        mirror.started = true;

        if let Some(fps) = paint_fps {
            let producer = mirror.producer.clone();
            let geometry = mirror.geometry;
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let period = Duration::from_micros(1_000_000 / fps as u64);
            let thread = std::thread::Builder::new()
                .name(format!("synthetic-painter-{}", self.id))
                .spawn(move || {
                    let mut tick = 0u32;
                    while !stop_flag.load(Ordering::Acquire) && !producer.is_closed() {
                        producer.write_frame(geometry, |buf| paint_pattern(buf, geometry, tick));
                        tick = tick.wrapping_add(1);
                        std::thread::sleep(period);
                    }
                })
                .map_err(|e| CaptureError::resource(format!("painter thread: {e}")))?;
            self.painter = Some(Painter { stop, thread });
        }
        debug!("Synthetic display: mirror {} streaming", self.id);
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(painter) = self.painter.take() {
            painter.stop.store(true, Ordering::Release);
            let _ = painter.thread.join();
        }
        self.shared.lock().mirrors.retain(|m| m.id != self.id);
        debug!("Synthetic display: mirror {} released", self.id);
    }
}

impl Drop for SyntheticMirrorHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Painting ──────────────────────────────────────────────────────────────────

fn paint_solid(buf: &mut [u8], geometry: FrameGeometry, rgba: [u8; 4]) {
    paint_with(buf, geometry, |_, _| rgba);
}

/// Horizontal red ramp, vertical green ramp, blue cycling with `tick`.
fn paint_pattern(buf: &mut [u8], geometry: FrameGeometry, tick: u32) {
    let w = geometry.width.max(1);
    let h = geometry.height.max(1);
    let blue = (tick % 256) as u8;
    paint_with(buf, geometry, |x, y| {
        [(x * 255 / w) as u8, (y * 255 / h) as u8, blue, 0xFF]
    });
}

fn paint_with<F>(buf: &mut [u8], geometry: FrameGeometry, pixel: F)
where
    F: Fn(u32, u32) -> [u8; 4],
{
    let stride = geometry.row_stride_bytes as usize;
    let packed_row = geometry.width as usize * 4;
    if stride == 0 {
        return;
    }
    for (y, row) in buf.chunks_mut(stride).enumerate() {
        let visible = packed_row.min(row.len());
        for (x, px) in row[..visible].chunks_exact_mut(4).enumerate() {
            px.copy_from_slice(&pixel(x as u32, y as u32));
        }
        row[visible..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameBufferPool;

    fn config() -> CaptureConfig {
        CaptureConfig::new(4, 2)
    }

    async fn mirror(
        display: &SyntheticDisplay,
        pool: &FrameBufferPool,
    ) -> CaptureResult<Box<dyn MirrorHandle>> {
        let token = display.request_authorization().await?;
        let interrupt = InterruptHandle::new(pool.clone(), |_| {});
        display.create_mirror(token, &config(), pool.producer(), interrupt).await
    }

    #[tokio::test]
    async fn frames_flow_only_after_start() {
        let display = SyntheticDisplay::new().with_row_padding(8);
        let pool = FrameBufferPool::new(2);
        let mut handle = mirror(&display, &pool).await.unwrap();

        assert!(!display.commit_solid([1, 2, 3, 4]));
        handle.start().unwrap();
        assert!(display.commit_solid([1, 2, 3, 4]));

        let frame = pool.acquire_latest().unwrap();
        assert_eq!(frame.row_stride_bytes, 4 * 4 + 8);
        assert_eq!(&frame.pixel_buffer[..4], &[1, 2, 3, 4]);
        assert!(frame.pixel_buffer[16..24].iter().all(|&b| b == 0));

        handle.release();
        assert_eq!(display.live_mirrors(), 0);
        assert!(!display.commit_solid([0; 4]));
    }

    #[tokio::test]
    async fn tokens_are_single_use() {
        let display = SyntheticDisplay::new();
        let pool = FrameBufferPool::new(2);
        let token = display.request_authorization().await.unwrap();
        let forged = AuthorizationToken::new(token.id());
        let interrupt = InterruptHandle::new(pool.clone(), |_| {});

        let _handle = display
            .create_mirror(token, &config(), pool.producer(), interrupt.clone())
            .await
            .unwrap();
        let reused = display.create_mirror(forged, &config(), pool.producer(), interrupt).await;
        assert!(matches!(reused, Err(CaptureError::Authorization { .. })));
    }

    #[tokio::test]
    async fn discarded_token_cannot_be_redeemed() {
        let display = SyntheticDisplay::new();
        let pool = FrameBufferPool::new(2);
        let token = display.request_authorization().await.unwrap();
        let forged = AuthorizationToken::new(token.id());
        assert_eq!(display.outstanding_tokens(), 1);

        display.discard_token(token);
        assert_eq!(display.outstanding_tokens(), 0);
        let interrupt = InterruptHandle::new(pool.clone(), |_| {});
        let result = display.create_mirror(forged, &config(), pool.producer(), interrupt).await;
        assert!(matches!(result, Err(CaptureError::Authorization { .. })));
    }

    #[tokio::test]
    async fn expired_token_is_refused() {
        let display = SyntheticDisplay::new();
        display.set_token_ttl(Some(Duration::ZERO));
        let pool = FrameBufferPool::new(2);
        let result = mirror(&display, &pool).await;
        assert!(matches!(result, Err(CaptureError::Authorization { .. })));
        assert_eq!(display.live_mirrors(), 0);
    }

    #[tokio::test]
    async fn exhausted_slots_and_denial() {
        let display = SyntheticDisplay::new();
        let pool = FrameBufferPool::new(2);

        display.deny_next_authorization("user declined");
        assert!(matches!(mirror(&display, &pool).await, Err(CaptureError::Authorization { .. })));

        display.set_display_slots(0);
        assert!(matches!(mirror(&display, &pool).await, Err(CaptureError::Resource { .. })));

        display.set_display_slots(1);
        let _first = mirror(&display, &pool).await.unwrap();
        assert!(matches!(mirror(&display, &pool).await, Err(CaptureError::Resource { .. })));
    }

    #[tokio::test]
    async fn revoke_fires_interrupt_once() {
        let display = SyntheticDisplay::new();
        let pool = FrameBufferPool::new(2);
        let token = display.request_authorization().await.unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let interrupt = InterruptHandle::new(pool.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut handle = display
            .create_mirror(token, &config(), pool.producer(), interrupt)
            .await
            .unwrap();
        handle.start().unwrap();

        assert_eq!(display.revoke(TerminationReason::Revoked), 1);
        assert_eq!(display.revoke(TerminationReason::Revoked), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn painter_fills_the_pool() {
        let display = SyntheticDisplay::new().with_painter(200);
        let pool = FrameBufferPool::new(2);
        let mut handle = mirror(&display, &pool).await.unwrap();
        handle.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(f) = pool.acquire_latest() {
                break f;
            }
            assert!(Instant::now() < deadline, "painter produced no frame");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(frame.width, 4);
        assert_eq!(frame.pixel_buffer[3], 0xFF);
        drop(frame);
        handle.release();
    }
}
