//! Daemon wiring: backend + sinks + controller + snapshot loop, driven by
//! line commands on stdin until `quit` or Ctrl-C.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mirrorsnap_capture::SyntheticDisplay;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::{BackendKind, DaemonConfig};
use crate::controller::{
    ControllerHandle, Platform, SessionController, SessionSettings, StartOutcome, StopOutcome,
};
use crate::scheduler::SnapshotScheduler;
use crate::sink::{ArtifactSink, DirectorySink, FanoutSink, LogSink};

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    Start,
    Stop,
    Snap,
    Loop,
    Halt,
    Status,
    Quit,
}

impl FromStr for DaemonCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "snap" | "snapshot" => Ok(Self::Snap),
            "loop" => Ok(Self::Loop),
            "halt" => Ok(Self::Halt),
            "status" => Ok(Self::Status),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command {other:?} (start|stop|snap|loop|halt|status|quit)")),
        }
    }
}

impl fmt::Display for DaemonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Snap => "snap",
            Self::Loop => "loop",
            Self::Halt => "halt",
            Self::Status => "status",
            Self::Quit => "quit",
        };
        f.write_str(name)
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────────

/// Controller plus at most one snapshot loop.
pub struct Daemon {
    controller: ControllerHandle,
    interval:   Duration,
    scheduler:  Option<SnapshotScheduler>,
}

impl Daemon {
    pub fn new(controller: ControllerHandle, interval: Duration) -> Self {
        Self { controller, interval, scheduler: None }
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.controller
    }

    pub fn loop_active(&self) -> bool {
        self.scheduler.as_ref().is_some_and(|s| !s.is_finished())
    }

    /// Returns `false` once the daemon should exit.
    pub async fn execute(&mut self, cmd: DaemonCommand) -> Result<bool> {
        match cmd {
            DaemonCommand::Start => {
                match self.controller.start().await? {
                    StartOutcome::Started(id) => info!("Session {} started", id),
                    StartOutcome::AlreadyRunning(id) => info!("Session {} already running", id),
                }
            }
            DaemonCommand::Stop => {
                self.halt_loop().await;
                if let StopOutcome::Stopped(id) = self.controller.stop().await? {
                    info!("Session {} stopped", id);
                }
            }
            DaemonCommand::Snap => match self.controller.snapshot().await? {
                Some(a) => info!("Snapshot #{} {}x{} ({} bytes)", a.sequence, a.width, a.height, a.len()),
                None => info!("No snapshot: no active session or no frame yet"),
            },
            DaemonCommand::Loop => {
                if self.loop_active() {
                    info!("Snapshot loop already running");
                } else {
                    // Loop implies a session, as the capture service did.
                    self.controller.start().await?;
                    self.scheduler = Some(SnapshotScheduler::spawn(self.controller.clone(), self.interval));
                }
            }
            DaemonCommand::Halt => self.halt_loop().await,
            DaemonCommand::Status => {
                let status = self.controller.status().await?;
                info!(
                    "state={} session={} loop={} last_termination={} pool={:?}",
                    status.state,
                    status.session.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    self.loop_active(),
                    status.last_termination.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                    status.pool
                );
            }
            DaemonCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn halt_loop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.cancel();
            let (issued, delivered) = (scheduler.issued(), scheduler.delivered());
            scheduler.join().await;
            info!("Snapshot loop halted ({} issued, {} delivered)", issued, delivered);
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.halt_loop().await;
        self.controller.shutdown().await.context("Controller shutdown")?;
        Ok(())
    }
}

/// Execute line commands from `input` until `quit` or `shutdown` resolves.
/// Once the input ends only `shutdown` can finish the loop.
pub async fn command_loop<R, S>(daemon: &mut Daemon, input: R, shutdown: S)
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line(), if input_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Command input closed; waiting for shutdown");
                        input_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!("Command input failed: {}", e);
                        input_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let cmd = match line.parse::<DaemonCommand>() {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                match daemon.execute(cmd).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!("{} failed: {:#}", cmd, e),
                }
            }
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

pub fn build_platform(config: &DaemonConfig) -> Result<Platform> {
    match config.backend {
        BackendKind::Synthetic => {
            let mut display = SyntheticDisplay::new().with_row_padding(config.synthetic_row_padding);
            if config.synthetic_fps > 0 {
                display = display.with_painter(config.synthetic_fps);
            }
            info!(
                "Backend: synthetic display ({} fps, {} bytes row padding)",
                config.synthetic_fps, config.synthetic_row_padding
            );
            Ok(Platform::synthetic(&display))
        }
        BackendKind::PipeWire => pipewire_platform(),
    }
}

#[cfg(all(target_os = "linux", feature = "pipewire"))]
fn pipewire_platform() -> Result<Platform> {
    use mirrorsnap_capture::{LoggedPresence, PipeWireMirror, PortalAuthorizer};

    info!("Backend: PipeWire via XDG desktop portal");
    Ok(Platform {
        authorizer: Arc::new(PortalAuthorizer::default()),
        mirror:     Arc::new(PipeWireMirror),
        presence:   Arc::new(LoggedPresence),
    })
}

#[cfg(not(all(target_os = "linux", feature = "pipewire")))]
fn pipewire_platform() -> Result<Platform> {
    anyhow::bail!("PipeWire backend not compiled in (rebuild with --features pipewire)")
}

pub fn build_sink(config: &DaemonConfig) -> Result<Arc<dyn ArtifactSink>> {
    let mut fanout = FanoutSink::new().with(Arc::new(LogSink::default()));
    if let Some(dir) = &config.output_dir {
        let sink = DirectorySink::create(dir)?;
        info!("Snapshots will be written to {}", sink.dir().display());
        fanout = fanout.with(Arc::new(sink));
    }
    Ok(Arc::new(fanout))
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let platform = build_platform(&config)?;
    let sink = build_sink(&config)?;
    let settings = SessionSettings {
        capture:       config.capture.clone(),
        stride_policy: config.stride_policy,
        encoder:       config.encoder()?,
    };
    info!(
        "Capture {}x{} {:?}, {} slot(s), JPEG q={}, stride {:?}, every {:?}",
        settings.capture.width,
        settings.capture.height,
        settings.capture.pixel_format,
        settings.capture.buffer_slots,
        config.quality,
        config.stride_policy,
        config.snapshot_interval()
    );

    let (controller, controller_task) = SessionController::spawn(platform, settings, sink);

    // ── Log running transitions ────────────────────────────────────────────
    let mut running = controller.running();
    let watcher = tokio::spawn(async move {
        while running.changed().await.is_ok() {
            let now = *running.borrow_and_update();
            info!("Capture {}", if now { "running" } else { "stopped" });
        }
    });

    let mut daemon = Daemon::new(controller, config.snapshot_interval());
    if config.autostart {
        if let Err(e) = daemon.execute(DaemonCommand::Loop).await {
            warn!("Autostart failed: {:#}", e);
        }
    }

    info!("Commands: start | stop | snap | loop | halt | status | quit");
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received");
    };
    command_loop(&mut daemon, BufReader::new(tokio::io::stdin()), ctrl_c).await;

    daemon.shutdown().await?;
    controller_task.await.context("Controller task")?;
    let _ = watcher.await;
    Ok(())
}
