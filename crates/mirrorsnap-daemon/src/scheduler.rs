//! Periodic snapshot loop.
//!
//! Issues `snapshot` on a fixed period while the controller reports a
//! running session. Stops on its own when running turns false, on
//! [`SnapshotScheduler::cancel`], when dropped, or when the controller goes
//! away. Ticks that fall behind are delayed, never bunched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mirrorsnap_core::CaptureError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::controller::ControllerHandle;

#[derive(Debug, Default)]
struct Counters {
    issued:    AtomicU64,
    delivered: AtomicU64,
}

pub struct SnapshotScheduler {
    stop_tx:  mpsc::Sender<()>,
    task:     JoinHandle<()>,
    counters: Arc<Counters>,
}

impl SnapshotScheduler {
    pub fn spawn(controller: ControllerHandle, period: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run(controller, period, stop_rx, Arc::clone(&counters)));
        Self { stop_tx, task, counters }
    }

    /// Ask the loop to stop after the snapshot in flight, if any.
    pub fn cancel(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Wait for the loop to end on its own (or after [`Self::cancel`]).
    pub async fn join(self) {
        let Self { stop_tx, task, .. } = self;
        if let Err(e) = task.await {
            warn!("Snapshot loop task failed: {}", e);
        }
        drop(stop_tx);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Snapshot commands sent so far.
    pub fn issued(&self) -> u64 {
        self.counters.issued.load(Ordering::Relaxed)
    }

    /// Snapshots that produced an artifact.
    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }
}

async fn run(
    controller: ControllerHandle,
    period: Duration,
    mut stop_rx: mpsc::Receiver<()>,
    counters: Arc<Counters>,
) {
    let mut running = controller.running();
    if !*running.borrow_and_update() {
        debug!("Snapshot loop not started: no active session");
        return;
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Snapshot loop started (every {:?})", period);

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.recv() => {
                info!("Snapshot loop cancelled");
                break;
            }
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow_and_update() {
                    info!("Snapshot loop stopped: session no longer running");
                    break;
                }
            }
            _ = ticker.tick() => {
                counters.issued.fetch_add(1, Ordering::Relaxed);
                match controller.snapshot().await {
                    Ok(Some(artifact)) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        debug!("Snapshot #{} ({} bytes)", artifact.sequence, artifact.len());
                    }
                    Ok(None) => debug!("Snapshot skipped: no frame"),
                    Err(CaptureError::ControllerClosed) => {
                        info!("Snapshot loop stopped: controller closed");
                        break;
                    }
                    Err(e) => warn!("Snapshot failed: {}", e),
                }
            }
        }
    }
}
