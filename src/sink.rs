//! Telemetry sinks

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{PollerError, PollerResult};
use crate::snapshot::TelemetrySnapshot;

/// Destination of completed snapshots
///
/// Failures are reported to the session, which logs them and keeps polling.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn save_snapshot(&self, snapshot: &TelemetrySnapshot) -> PollerResult<()>;
}

/// Prints each snapshot to stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

#[async_trait]
impl TelemetrySink for ConsoleSink {
    async fn save_snapshot(&self, snapshot: &TelemetrySnapshot) -> PollerResult<()> {
        println!("{}", snapshot);
        Ok(())
    }
}

/// Appends one JSON document per snapshot to a file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    // serialises appends from concurrent sessions
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for FileSink {
    async fn save_snapshot(&self, snapshot: &TelemetrySnapshot) -> PollerResult<()> {
        let mut line = serde_json::to_string(snapshot)
            .map_err(|e| PollerError::sink(format!("Cannot serialize snapshot: {}", e)))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PollerError::sink(format!("Cannot open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PollerError::sink(format!("Cannot write {}: {}", self.path.display(), e)))?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps every snapshot in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    snapshots: Arc<Mutex<Vec<TelemetrySnapshot>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots saved so far, oldest first
    pub async fn snapshots(&self) -> Vec<TelemetrySnapshot> {
        self.snapshots.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.lock().await.is_empty()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn save_snapshot(&self, snapshot: &TelemetrySnapshot) -> PollerResult<()> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }
}
