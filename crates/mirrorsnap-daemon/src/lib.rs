//! mirrorsnap daemon: periodic JPEG snapshots of a mirrored display.
//!
//! ```text
//! SnapshotScheduler ──snapshot──► SessionController (actor)
//!                                      │ owns at most one
//!                                      ▼
//!                                CaptureSession ──► FrameBufferPool ◄── platform mirror
//!                                      │
//!                         stride::correct → JpegEncoder
//!                                      │
//!                                      ▼
//!                                ArtifactSink (log / directory / channel)
//! ```

pub mod app;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use config::{BackendKind, DaemonConfig};
pub use controller::{
    ControllerHandle, ControllerStatus, Platform, SessionController, SessionSettings, StartOutcome,
    StopOutcome,
};
pub use encoder::JpegEncoder;
pub use scheduler::SnapshotScheduler;
pub use session::{CaptureSession, SessionPhase};
pub use sink::{ArtifactSink, ChannelSink, DirectorySink, FanoutSink, LogSink};
