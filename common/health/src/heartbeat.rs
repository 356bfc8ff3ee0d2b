//! File-based liveness heartbeat.
//!
//! The worker writes the current unix time in milliseconds to a well-known
//! path at startup and then every `interval`. An external probe checks the
//! file's mtime; anything older than [`HeartbeatFile::STALENESS_BUDGET`]
//! means the process is hung or dead. A shutdown that wedges stops the
//! writer and fails the probe naturally.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::warn;

pub struct HeartbeatFile {
    path: PathBuf,
    interval: Duration,
}

impl HeartbeatFile {
    /// How stale the probe should tolerate the file being. Four missed
    /// beats at the default interval.
    pub const STALENESS_BUDGET: Duration = Duration::from_secs(120);

    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Write one beat immediately. Failures are logged, never fatal: a
    /// worker that cannot write its heartbeat should keep working and let
    /// the probe restart it.
    pub async fn beat(&self) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if let Err(error) = tokio::fs::write(&self.path, millis.to_string()).await {
            warn!(path = %self.path.display(), %error, "failed to write heartbeat file");
        }
    }

    /// Beat once now, then keep beating every interval until the returned
    /// task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                // The first tick fires immediately, covering the startup beat.
                ticker.tick().await;
                self.beat().await;
            }
        })
    }
}
