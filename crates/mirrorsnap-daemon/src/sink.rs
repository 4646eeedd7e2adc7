//! Artifact sinks: where encoded snapshots go.
//!
//! Sinks are called from the blocking pool right after `capture_once`, so
//! `deliver` may do file I/O directly. A failing sink is logged by the
//! controller; the snapshot itself still succeeds.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mirrorsnap_core::EncodedArtifact;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub trait ArtifactSink: Send + Sync {
    fn deliver(&self, artifact: &EncodedArtifact) -> anyhow::Result<()>;
}

// ── LogSink ───────────────────────────────────────────────────────────────────

/// Logs every artifact as a base64 JPEG string.
///
/// Info level carries a preview of `preview_chars` characters; the full
/// payload is only emitted at trace level.
#[derive(Debug, Clone)]
pub struct LogSink {
    preview_chars: usize,
}

impl Default for LogSink {
    fn default() -> Self {
        Self { preview_chars: 64 }
    }
}

impl LogSink {
    pub fn with_preview(preview_chars: usize) -> Self {
        Self { preview_chars }
    }
}

impl ArtifactSink for LogSink {
    fn deliver(&self, artifact: &EncodedArtifact) -> anyhow::Result<()> {
        let encoded = BASE64.encode(&artifact.bytes);
        let preview = &encoded[..encoded.len().min(self.preview_chars)];
        info!(
            "Snapshot {} #{} {}x{} q={} {} bytes base64={}…",
            artifact.session_id.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            artifact.sequence,
            artifact.width,
            artifact.height,
            artifact.quality_used,
            artifact.len(),
            preview
        );
        trace!(target: "mirrorsnap::artifact", "{}", encoded);
        Ok(())
    }
}

// ── DirectorySink ─────────────────────────────────────────────────────────────

/// Writes `session-<id>-<seq>-<millis>.jpg` files into one directory.
///
/// Session ids restart at 1 on every run, so the capture time is part of the
/// name and existing files are never replaced; a clash gets a `-<n>` suffix.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Creates `dir` (and parents) if missing.
    pub fn create(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Creating output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(artifact: &EncodedArtifact) -> String {
        let session = artifact.session_id.map(|s| s.0).unwrap_or(0);
        let millis = artifact
            .captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("session-{session}-{:06}-{millis}.jpg", artifact.sequence)
    }

    fn create_unique(&self, artifact: &EncodedArtifact) -> anyhow::Result<(PathBuf, fs::File)> {
        let name = Self::file_name(artifact);
        let stem = name.trim_end_matches(".jpg");
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = match attempt {
                0 => self.dir.join(&name),
                n => self.dir.join(format!("{stem}-{n}.jpg")),
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Creating snapshot {}", path.display()))
                }
            }
        }
        anyhow::bail!("No free file name for {} in {}", name, self.dir.display())
    }
}

const MAX_NAME_ATTEMPTS: u32 = 1000;

impl ArtifactSink for DirectorySink {
    fn deliver(&self, artifact: &EncodedArtifact) -> anyhow::Result<()> {
        let (path, mut file) = self.create_unique(artifact)?;
        file.write_all(&artifact.bytes)
            .with_context(|| format!("Writing snapshot {}", path.display()))?;
        debug!("Snapshot written to {}", path.display());
        Ok(())
    }
}

// ── FanoutSink ────────────────────────────────────────────────────────────────

/// Delivers to every inner sink, even when an earlier one fails; the first
/// failure is returned.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ArtifactSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ArtifactSink for FanoutSink {
    fn deliver(&self, artifact: &EncodedArtifact) -> anyhow::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(artifact) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ── ChannelSink ───────────────────────────────────────────────────────────────

/// Forwards artifacts to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EncodedArtifact>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EncodedArtifact>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ArtifactSink for ChannelSink {
    fn deliver(&self, artifact: &EncodedArtifact) -> anyhow::Result<()> {
        self.tx
            .send(artifact.clone())
            .map_err(|_| anyhow::anyhow!("artifact receiver dropped"))
    }
}
