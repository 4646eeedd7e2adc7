//! mirrorsnap-capture: display mirroring for the mirrorsnap daemon.
//!
//! # Capture backends
//!
//! | Backend | Protocol | Build |
//! |---------|---------|-------|
//! | Synthetic (in-process test display) | none | always |
//! | PipeWire (ashpd + GStreamer) | Wayland + X11 via portal | `--features pipewire` |
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> mirrorsnap_core::CaptureResult<()> {
//! use mirrorsnap_capture::{
//!     correct, Authorizer, DisplayMirror, FrameBufferPool, InterruptHandle, MirrorHandle,
//!     SyntheticDisplay,
//! };
//! use mirrorsnap_core::{CaptureConfig, StridePolicy};
//!
//! let display = SyntheticDisplay::new();
//! let config = CaptureConfig::default();
//! let pool = FrameBufferPool::new(config.buffer_slots);
//! let interrupt = InterruptHandle::new(pool.clone(), |reason| eprintln!("ended: {reason}"));
//!
//! let token = display.request_authorization().await?;
//! let mut mirror = display.create_mirror(token, &config, pool.producer(), interrupt).await?;
//! mirror.start()?;
//!
//! if let Some(frame) = pool.acquire_latest() {
//!     let packed = correct(&frame, StridePolicy::Crop)?;
//!     // packed.pixels: width * height * 4 bytes RGBA
//! }
//! mirror.release();
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Authorizer ──► AuthorizationToken
//!                      │
//!                      ▼
//! DisplayMirror::create_mirror(token, FrameProducer, InterruptHandle)
//!                      │
//!       platform thread writes ──► FrameBufferPool ──► acquire_latest()
//!                                                          │
//!                                                          ▼
//!                                                  stride::correct() ──► PackedImage
//! ```

mod backend;
mod interrupt;
mod pool;
mod stride;
mod synthetic;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
mod pipewire;

pub use backend::{Authorizer, DisplayMirror, ForegroundPresence, LoggedPresence, MirrorHandle};
pub use interrupt::InterruptHandle;
pub use pool::{FrameBufferPool, FrameGeometry, FrameProducer, PoolStats, PooledFrame};
pub use stride::correct;
pub use synthetic::SyntheticDisplay;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub use pipewire::{PipeWireMirror, PortalAuthorizer};
