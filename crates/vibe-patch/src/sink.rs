//! Append-only event persistence
//!
//! The ordered event list for a batch id is the only record of that batch's
//! status. Sinks must therefore return events for a batch in append order and
//! never rewrite or drop one.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use vibe_core::{PatchEvent, Result, VibeError};

/// Append-only event log (allows mocking in tests)
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one event
    async fn append(&self, event: &PatchEvent) -> Result<()>;

    /// All events for a batch, oldest first
    async fn query_by_patch_id(&self, patch_id: &str) -> Result<Vec<PatchEvent>>;
}

/// In-memory event log
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<PatchEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event ever appended, in order
    pub async fn all(&self) -> Vec<PatchEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: &PatchEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query_by_patch_id(&self, patch_id: &str) -> Result<Vec<PatchEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.patch_id == patch_id)
            .cloned()
            .collect())
    }
}

/// JSONL event log, one event per line
pub struct AppendFileEventSink {
    path: PathBuf,
    /// Serializes appends so lines never interleave
    append_lock: Mutex<()>,
}

impl AppendFileEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for AppendFileEventSink {
    async fn append(&self, event: &PatchEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let _guard = self.append_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                VibeError::EventLog(format!("Failed to open {}: {}", self.path.display(), e))
            })?;

        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;

        debug!(
            "Appended {} for {} to {:?}",
            event.event_type, event.patch_id, self.path
        );
        Ok(())
    }

    async fn query_by_patch_id(&self, patch_id: &str) -> Result<Vec<PatchEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let mut events = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<PatchEvent>(line) {
                Ok(event) if event.patch_id == patch_id => events.push(event),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Skipping unreadable event at {:?}:{}: {}",
                        self.path,
                        lineno + 1,
                        e
                    );
                }
            }
        }

        Ok(events)
    }
}
