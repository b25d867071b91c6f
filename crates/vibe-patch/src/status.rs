//! Batch status, derived from the event log
//!
//! Nothing here is cached or stored. Every query re-reads the log and folds
//! it oldest to newest, so the answer can never drift from the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vibe_core::{EventStatus, EventType, PatchEvent, Result, RollbackId};

use crate::sink::EventSink;

/// Lifecycle state of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Derived view of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub patch_id: String,
    pub status: BatchStatus,
    pub progress: Progress,
    pub events: Vec<PatchEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// A rollback for this batch completed successfully
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_id: Option<RollbackId>,
}

/// Fold an ordered event list into a status report.
///
/// Returns `None` for an empty list. Rollback events do not move the
/// lifecycle state; they only set `rolled_back`. A validate-only run has no
/// processing terminal, so its `PATCH_VALIDATION_COMPLETED` event closes it
/// as completed or failed according to the event's status.
pub fn derive_status(patch_id: &str, events: Vec<PatchEvent>) -> Option<StatusReport> {
    let first = events.first()?;
    let created_at = first.created_at;
    let updated_at = events.last().map(|e| e.created_at).unwrap_or(created_at);

    let mut status = BatchStatus::Pending;
    let mut progress = Progress::default();
    let mut rolled_back = false;
    let mut rollback_id = None;

    for event in &events {
        match event.event_type {
            EventType::PatchProcessingStarted => {
                status = BatchStatus::Processing;
                progress.total = event
                    .meta("operationCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
            }
            EventType::PatchOperationApplied => progress.applied += 1,
            EventType::PatchOperationFailed => progress.failed += 1,
            EventType::PatchValidationCompleted => {
                status = match event.status {
                    EventStatus::Success => BatchStatus::Completed,
                    EventStatus::Failure => BatchStatus::Failed,
                };
            }
            EventType::PatchProcessingCompleted => status = BatchStatus::Completed,
            EventType::PatchProcessingFailed => status = BatchStatus::Failed,
            EventType::PatchRollbackCompleted | EventType::PatchRollbackFailed => {
                if event.event_type == EventType::PatchRollbackCompleted {
                    rolled_back = true;
                }
                if let Some(id) = event.meta("rollbackId").and_then(|v| v.as_str()) {
                    rollback_id = Some(RollbackId::from(id));
                }
            }
        }
    }

    Some(StatusReport {
        patch_id: patch_id.to_string(),
        status,
        progress,
        events,
        created_at,
        updated_at,
        rolled_back,
        rollback_id,
    })
}

/// Answers status queries straight from an event sink
#[derive(Clone)]
pub struct StatusTracker {
    sink: Arc<dyn EventSink>,
}

impl StatusTracker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Current status of a batch, or `None` if it has no events
    pub async fn get_status(&self, batch_id: &str) -> Result<Option<StatusReport>> {
        let events = self.sink.query_by_patch_id(batch_id).await?;
        Ok(derive_status(batch_id, events))
    }
}
