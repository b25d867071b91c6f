//! Batch application engine
//!
//! Processes one batch strictly in order:
//!
//! 1. `PATCH_PROCESSING_STARTED`
//! 2. validate-only: a single `PATCH_VALIDATION_COMPLETED`, then return
//! 3. per operation: `PATCH_OPERATION_APPLIED` or `PATCH_OPERATION_FAILED`,
//!    with an automatic rollback of everything applied so far after a
//!    failure when `rollback_on_failure` is set
//! 4. `PATCH_PROCESSING_COMPLETED` or `PATCH_PROCESSING_FAILED`
//!
//! Each event is appended to the sink and then handed to the publisher before
//! the next one is produced, so persisted and published order always match.
//! `apply_patches` never returns an error: every failure ends up in the
//! result's `errors`.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use vibe_core::{
    AppliedRecord, EventType, PatchBatch, PatchEvent, PatchOperation, Result, RollbackId,
    VibeError,
};

use crate::publisher::{EventPublisher, NoopPublisher};
use crate::rollback::{
    pending_reversals, reverse_records, rollback_event, RollbackOutcome, RollbackRequest,
    RollbackTrigger,
};
use crate::sink::EventSink;
use crate::status::{StatusReport, StatusTracker};
use crate::store::ResourceStore;

/// Per-call switches for `apply_patches`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyOptions {
    /// Apply against scratch copies; nothing is written and nothing rolls back
    pub dry_run: bool,
    /// Shape-check operations only; the store is never touched
    pub validate_only: bool,
    pub rollback_on_failure: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            validate_only: false,
            rollback_on_failure: true,
        }
    }
}

/// Category of an entry in `ApplyResult::errors`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    Validation,
    Application,
    Rollback,
    EventLog,
    /// The store panicked; processing stopped
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub kind: ApplyErrorKind,
    pub message: String,
}

impl ApplyError {
    fn new(index: Option<usize>, kind: ApplyErrorKind, message: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(index) => write!(f, "operation {}: {}", index, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of one `apply_patches` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub patch_id: String,
    pub success: bool,
    pub applied_count: usize,
    pub failed_count: usize,
    pub errors: Vec<ApplyError>,
    /// Events emitted by this call, in emission order
    pub events: Vec<PatchEvent>,
    /// Present when at least one operation was really applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_id: Option<RollbackId>,
    pub rollback_attempted: bool,
    pub reversed_count: usize,
}

/// Store panic caught at the engine boundary
#[derive(Debug, Clone)]
pub(crate) struct EngineFault(String);

impl std::fmt::Display for EngineFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine fault: {}", self.0)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a store call, turning a panic into an `EngineFault`
pub(crate) async fn guarded<T, F>(fut: F) -> std::result::Result<Result<T>, EngineFault>
where
    F: Future<Output = Result<T>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| EngineFault(panic_message(payload)))
}

/// Working state for one batch
struct Run {
    patch_id: String,
    rollback_id: RollbackId,
    events: Vec<PatchEvent>,
    errors: Vec<ApplyError>,
    /// Applied and not yet reversed
    applied: Vec<(usize, AppliedRecord)>,
    applied_count: usize,
    failed_count: usize,
    reversed_count: usize,
    rollback_attempted: bool,
    fault: Option<String>,
}

impl Run {
    fn new(patch_id: String) -> Self {
        Self {
            rollback_id: RollbackId::for_batch(&patch_id),
            patch_id,
            events: Vec::new(),
            errors: Vec::new(),
            applied: Vec::new(),
            applied_count: 0,
            failed_count: 0,
            reversed_count: 0,
            rollback_attempted: false,
            fault: None,
        }
    }

    fn into_result(self, success: bool, dry_run: bool) -> ApplyResult {
        let rollback_id = if !dry_run && self.applied_count > 0 {
            Some(self.rollback_id)
        } else {
            None
        };

        ApplyResult {
            patch_id: self.patch_id,
            success,
            applied_count: self.applied_count,
            failed_count: self.failed_count,
            errors: self.errors,
            events: self.events,
            rollback_id,
            rollback_attempted: self.rollback_attempted,
            reversed_count: self.reversed_count,
        }
    }
}

/// Applies batches through a resource store and records their lifecycle
#[derive(Clone)]
pub struct PatchEngine {
    store: Arc<dyn ResourceStore>,
    sink: Arc<dyn EventSink>,
    publisher: Arc<dyn EventPublisher>,
}

impl PatchEngine {
    pub fn new(store: Arc<dyn ResourceStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            publisher: Arc::new(NoopPublisher),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn status_tracker(&self) -> StatusTracker {
        StatusTracker::new(self.sink.clone())
    }

    /// Apply a batch. Never fails; see the returned result.
    #[instrument(skip_all, fields(requester = %batch.requester, operations = batch.len()))]
    pub async fn apply_patches(&self, batch: &PatchBatch, options: ApplyOptions) -> ApplyResult {
        let mut run = Run::new(batch.resolve_id());

        // Batch ids are single-use.
        match self.sink.query_by_patch_id(&run.patch_id).await {
            Ok(existing) if !existing.is_empty() => {
                warn!("Rejected batch {}: id already has {} events", run.patch_id, existing.len());
                run.errors.push(ApplyError::new(
                    None,
                    ApplyErrorKind::Validation,
                    format!("batch id already used: {}", run.patch_id),
                ));
                return run.into_result(false, options.dry_run);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not check event log for {}: {}", run.patch_id, e),
        }

        info!("Processing batch {} ({} operations)", run.patch_id, batch.len());

        let started = PatchEvent::success(
            &run.patch_id,
            EventType::PatchProcessingStarted,
            json!({
                "operationCount": batch.len(),
                "dryRun": options.dry_run,
                "validateOnly": options.validate_only,
                "rollbackOnFailure": options.rollback_on_failure,
                "requester": batch.requester,
                "reason": batch.reason,
                "branch": batch.branch,
            }),
        );
        self.emit(&mut run, started).await;

        if options.validate_only {
            return self.validate_batch(run, batch).await;
        }

        for (index, op) in batch.patches.iter().enumerate() {
            let outcome = match op.validate() {
                Err(e) => Ok(Err(e)),
                Ok(_) if options.dry_run => guarded(self.store.dry_run(op)).await,
                Ok(_) => guarded(self.store.apply(op)).await,
            };

            match outcome {
                Ok(Ok(record)) => {
                    self.record_applied(&mut run, index, op, record, options.dry_run)
                        .await
                }
                Ok(Err(e)) => {
                    self.record_failed(&mut run, index, op, &e).await;
                    if options.rollback_on_failure && !options.dry_run {
                        let reason = format!("operation {} failed: {}", index, e);
                        self.roll_back(&mut run, RollbackTrigger::Automatic, &reason)
                            .await;
                    }
                }
                Err(fault) => {
                    error!("Batch {} aborted at operation {}: {}", run.patch_id, index, fault);
                    run.errors.push(ApplyError::new(
                        Some(index),
                        ApplyErrorKind::Fault,
                        fault.to_string(),
                    ));
                    run.fault = Some(fault.to_string());
                    break;
                }
            }
        }

        // Operations applied after the last failure are still in place.
        let failed = run.failed_count > 0 || run.fault.is_some();
        if failed && options.rollback_on_failure && !options.dry_run {
            self.roll_back(&mut run, RollbackTrigger::Automatic, "batch finished with failures")
                .await;
        }

        self.finish(run, batch.len(), options.dry_run).await
    }

    /// Current status of a batch, derived from its events
    pub async fn get_patch_status(&self, patch_id: &str) -> Result<Option<StatusReport>> {
        self.status_tracker().get_status(patch_id).await
    }

    /// Reverse whatever a batch still has applied, as recorded in the log
    #[instrument(skip_all, fields(rollback_id = %request.rollback_id))]
    pub async fn rollback_patch(&self, request: RollbackRequest) -> RollbackOutcome {
        let rollback_id = request.rollback_id.clone();

        let patch_id = match rollback_id.batch_id() {
            Some(id) => id.to_string(),
            None => {
                warn!("Rejected malformed rollback id {}", rollback_id);
                return RollbackOutcome::rejected(
                    rollback_id.clone(),
                    None,
                    format!("malformed rollback id: {}", rollback_id),
                );
            }
        };

        let events = match self.sink.query_by_patch_id(&patch_id).await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to read events for {}: {}", patch_id, e);
                return RollbackOutcome::rejected(
                    rollback_id,
                    Some(patch_id),
                    format!("failed to read event log: {}", e),
                );
            }
        };

        if events.is_empty() {
            return RollbackOutcome::rejected(
                rollback_id,
                Some(patch_id.clone()),
                format!("no events recorded for batch {}", patch_id),
            );
        }

        let pending = pending_reversals(&events);
        if pending.is_empty() {
            info!("Nothing left to roll back for {}", patch_id);
            return RollbackOutcome::rejected(
                rollback_id,
                Some(patch_id),
                "nothing to roll back",
            );
        }

        info!("Rolling back {} operations of {}", pending.len(), patch_id);
        let reversal = reverse_records(self.store.as_ref(), pending).await;
        let event = rollback_event(
            &patch_id,
            &rollback_id,
            RollbackTrigger::Manual,
            request.reason.as_deref(),
            &reversal,
        );

        let mut errors: Vec<String> = reversal
            .failures
            .iter()
            .map(|(index, e)| format!("operation {}: {}", index, e))
            .collect();
        if let Some(e) = self.persist_and_publish(&event).await {
            errors.push(e);
        }

        RollbackOutcome {
            rollback_id,
            patch_id: Some(patch_id),
            success: reversal.is_clean(),
            failed: reversal.failures.iter().map(|(i, _)| *i).collect(),
            reversed: reversal.reversed,
            errors,
        }
    }

    async fn validate_batch(&self, mut run: Run, batch: &PatchBatch) -> ApplyResult {
        let mut invalid = Vec::new();

        for (index, op) in batch.patches.iter().enumerate() {
            if let Err(e) = op.validate() {
                invalid.push(json!({"index": index, "error": e.to_string()}));
                run.errors.push(ApplyError::new(
                    Some(index),
                    ApplyErrorKind::Validation,
                    e.to_string(),
                ));
            }
        }

        run.failed_count = invalid.len();
        let metadata = json!({
            "operationCount": batch.len(),
            "validCount": batch.len() - invalid.len(),
            "invalidCount": invalid.len(),
            "invalid": invalid,
        });

        let success = run.failed_count == 0;
        let event = if success {
            PatchEvent::success(&run.patch_id, EventType::PatchValidationCompleted, metadata)
        } else {
            PatchEvent::failure(&run.patch_id, EventType::PatchValidationCompleted, metadata)
        };
        self.emit(&mut run, event).await;

        info!(
            "Validated batch {}: {} of {} operations invalid",
            run.patch_id,
            run.failed_count,
            batch.len()
        );
        run.into_result(success, true)
    }

    async fn record_applied(
        &self,
        run: &mut Run,
        index: usize,
        op: &PatchOperation,
        record: AppliedRecord,
        dry_run: bool,
    ) {
        run.applied_count += 1;

        let event = PatchEvent::success(
            &run.patch_id,
            EventType::PatchOperationApplied,
            json!({
                "index": index,
                "op": op.op,
                "file": op.file,
                "path": op.path,
                "dryRun": dry_run,
                "record": record,
            }),
        );

        if !dry_run {
            run.applied.push((index, record));
        }
        self.emit(run, event).await;
    }

    async fn record_failed(&self, run: &mut Run, index: usize, op: &PatchOperation, e: &VibeError) {
        warn!("Operation {} ({} {}) failed: {}", index, op.op, op.path, e);
        run.failed_count += 1;

        let kind = match e {
            VibeError::Validation(_) => ApplyErrorKind::Validation,
            _ => ApplyErrorKind::Application,
        };
        run.errors.push(ApplyError::new(Some(index), kind, e.to_string()));

        let event = PatchEvent::failure(
            &run.patch_id,
            EventType::PatchOperationFailed,
            json!({
                "index": index,
                "op": op.op,
                "file": op.file,
                "path": op.path,
                "error": e.to_string(),
            }),
        );
        self.emit(run, event).await;
    }

    /// Reverse everything still applied in this run, newest first
    async fn roll_back(&self, run: &mut Run, trigger: RollbackTrigger, reason: &str) {
        if run.applied.is_empty() {
            return;
        }

        run.rollback_attempted = true;
        let records = std::mem::take(&mut run.applied);
        info!("Rolling back {} operations of {}", records.len(), run.patch_id);

        let reversal = reverse_records(self.store.as_ref(), records).await;
        run.reversed_count += reversal.reversed.len();
        for (index, message) in &reversal.failures {
            run.errors.push(ApplyError::new(
                Some(*index),
                ApplyErrorKind::Rollback,
                message.clone(),
            ));
        }

        let event = rollback_event(&run.patch_id, &run.rollback_id, trigger, Some(reason), &reversal);
        self.emit(run, event).await;
    }

    async fn finish(&self, mut run: Run, total: usize, dry_run: bool) -> ApplyResult {
        let success = run.failed_count == 0 && run.fault.is_none();

        let mut metadata = json!({
            "operationCount": total,
            "appliedCount": run.applied_count,
            "failedCount": run.failed_count,
            "reversedCount": run.reversed_count,
            "dryRun": dry_run,
        });
        if let Some(fault) = &run.fault {
            metadata["fault"] = json!(fault);
        }

        let event = if success {
            PatchEvent::success(&run.patch_id, EventType::PatchProcessingCompleted, metadata)
        } else {
            PatchEvent::failure(&run.patch_id, EventType::PatchProcessingFailed, metadata)
        };
        self.emit(&mut run, event).await;

        info!(
            "Batch {} {}: {} applied, {} failed",
            run.patch_id,
            if success { "completed" } else { "failed" },
            run.applied_count,
            run.failed_count
        );
        run.into_result(success, dry_run)
    }

    async fn emit(&self, run: &mut Run, event: PatchEvent) {
        if let Some(e) = self.persist_and_publish(&event).await {
            run.errors.push(ApplyError::new(None, ApplyErrorKind::EventLog, e));
        }
        run.events.push(event);
    }

    /// Append then publish. Returns the append error, if any.
    async fn persist_and_publish(&self, event: &PatchEvent) -> Option<String> {
        let append_error = match self.sink.append(event).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    "Failed to record {} for {}: {}",
                    event.event_type, event.patch_id, e
                );
                Some(format!("failed to record {}: {}", event.event_type, e))
            }
        };

        self.publisher.publish(event).await;
        append_error
    }
}
