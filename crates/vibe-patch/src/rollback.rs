//! Reversal of applied operations
//!
//! Automatic and manual rollback share the same machinery: a list of
//! `(index, AppliedRecord)` pairs reversed newest first. For manual rollback
//! that list is rebuilt from the event log, since every
//! `PATCH_OPERATION_APPLIED` event carries its record and every rollback
//! event lists the indices it reversed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use vibe_core::{AppliedRecord, EventType, PatchEvent, RollbackId};

use crate::engine::guarded;
use crate::store::ResourceStore;

/// What started a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackTrigger {
    /// The engine, after an operation failed
    Automatic,
    /// A caller, via `rollback_patch`
    Manual,
}

impl RollbackTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

/// Request to reverse whatever a batch still has applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub rollback_id: RollbackId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RollbackRequest {
    pub fn new(rollback_id: impl Into<RollbackId>) -> Self {
        Self {
            rollback_id: rollback_id.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Result of an explicit rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub rollback_id: RollbackId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_id: Option<String>,
    pub success: bool,
    /// Operation indices reversed, in reversal order
    pub reversed: Vec<usize>,
    /// Operation indices whose reversal failed
    pub failed: Vec<usize>,
    pub errors: Vec<String>,
}

impl RollbackOutcome {
    pub(crate) fn rejected(
        rollback_id: RollbackId,
        patch_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            rollback_id,
            patch_id,
            success: false,
            reversed: Vec::new(),
            failed: Vec::new(),
            errors: vec![error.into()],
        }
    }
}

/// Per-record results of one reversal pass
#[derive(Debug, Default)]
pub(crate) struct Reversal {
    pub reversed: Vec<usize>,
    pub failures: Vec<(usize, String)>,
}

impl Reversal {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reverse records newest first. A record that fails to reverse is reported
/// and the pass moves on to the next one.
pub(crate) async fn reverse_records(
    store: &dyn ResourceStore,
    records: Vec<(usize, AppliedRecord)>,
) -> Reversal {
    let mut reversal = Reversal::default();

    for (index, record) in records.into_iter().rev() {
        match guarded(store.reverse(&record)).await {
            Ok(Ok(())) => {
                debug!("Reversed operation {}", index);
                reversal.reversed.push(index);
            }
            Ok(Err(e)) => {
                warn!("Failed to reverse operation {}: {}", index, e);
                reversal.failures.push((index, e.to_string()));
            }
            Err(fault) => {
                warn!("Store faulted reversing operation {}: {}", index, fault);
                reversal.failures.push((index, fault.to_string()));
            }
        }
    }

    reversal
}

/// `PATCH_ROLLBACK_COMPLETED` or `PATCH_ROLLBACK_FAILED` for a reversal pass
pub(crate) fn rollback_event(
    patch_id: &str,
    rollback_id: &RollbackId,
    trigger: RollbackTrigger,
    reason: Option<&str>,
    reversal: &Reversal,
) -> PatchEvent {
    let failures: Vec<Value> = reversal
        .failures
        .iter()
        .map(|(index, error)| json!({"index": index, "error": error}))
        .collect();

    let metadata = json!({
        "rollbackId": rollback_id,
        "trigger": trigger.as_str(),
        "reason": reason,
        "reversedIndices": reversal.reversed,
        "failures": failures,
    });

    if reversal.is_clean() {
        PatchEvent::success(patch_id, EventType::PatchRollbackCompleted, metadata)
    } else {
        PatchEvent::failure(patch_id, EventType::PatchRollbackFailed, metadata)
    }
}

/// Records a batch still has applied, oldest first, recovered from its log.
///
/// Dry-run applications are skipped. Each index listed in a rollback event's
/// `reversedIndices` cancels the most recent application at that index.
pub fn pending_reversals(events: &[PatchEvent]) -> Vec<(usize, AppliedRecord)> {
    let mut pending: Vec<(usize, AppliedRecord)> = Vec::new();

    for event in events {
        match event.event_type {
            EventType::PatchOperationApplied => {
                if event.meta("dryRun").and_then(Value::as_bool).unwrap_or(false) {
                    continue;
                }

                let index = event.meta("index").and_then(Value::as_u64);
                let record = event
                    .meta("record")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<AppliedRecord>(v).ok());

                match (index, record) {
                    (Some(index), Some(record)) => pending.push((index as usize, record)),
                    _ => warn!(
                        "Event {} for {} has no usable applied record",
                        event.id, event.patch_id
                    ),
                }
            }
            EventType::PatchRollbackCompleted | EventType::PatchRollbackFailed => {
                let reversed = event
                    .meta("reversedIndices")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                for index in reversed.iter().filter_map(Value::as_u64) {
                    if let Some(pos) = pending.iter().rposition(|(i, _)| *i as u64 == index) {
                        pending.remove(pos);
                    }
                }
            }
            _ => {}
        }
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use vibe_core::PatchOperation;

    fn applied(patch_id: &str, index: usize, record: &AppliedRecord, dry_run: bool) -> PatchEvent {
        PatchEvent::success(
            patch_id,
            EventType::PatchOperationApplied,
            json!({"index": index, "dryRun": dry_run, "record": record}),
        )
    }

    #[test]
    fn test_pending_reversals_replays_log() {
        let r0 = AppliedRecord::new(PatchOperation::add("f", "/a", json!(1)), None);
        let r1 = AppliedRecord::new(PatchOperation::add("f", "/b", json!(2)), None);
        let r2 = AppliedRecord::new(PatchOperation::add("f", "/c", json!(3)), None);

        let events = vec![
            applied("b1", 0, &r0, false),
            applied("b1", 1, &r1, false),
            PatchEvent::success(
                "b1",
                EventType::PatchRollbackCompleted,
                json!({"reversedIndices": [1, 0]}),
            ),
            applied("b1", 2, &r2, false),
        ];

        let pending = pending_reversals(&events);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 2);
        assert_eq!(pending[0].1, r2);
    }

    #[test]
    fn test_pending_reversals_skips_dry_runs() {
        let r0 = AppliedRecord::new(PatchOperation::add("f", "/a", json!(1)), None);
        let events = vec![applied("b1", 0, &r0, true)];
        assert!(pending_reversals(&events).is_empty());
    }

    #[tokio::test]
    async fn test_reverse_records_newest_first_and_continues() {
        let store = MemoryDocumentStore::new().with_document("f", json!({"a": 1, "b": 2}));

        let good = store
            .apply(&PatchOperation::replace("f", "/a", json!(10)))
            .await
            .unwrap();
        // No pre-image, so this one cannot be reversed.
        let bad = AppliedRecord::new(PatchOperation::remove("f", "/zzz"), None);
        let later = store
            .apply(&PatchOperation::add("f", "/c", json!(3)))
            .await
            .unwrap();

        let reversal =
            reverse_records(&store, vec![(0, good), (1, bad), (2, later)]).await;
        assert_eq!(reversal.reversed, vec![2, 0]);
        assert_eq!(reversal.failures.len(), 1);
        assert_eq!(reversal.failures[0].0, 1);
        assert_eq!(store.document("f").await, Some(json!({"a": 1, "b": 2})));

        let event = rollback_event(
            "b1",
            &RollbackId::for_batch("b1"),
            RollbackTrigger::Automatic,
            None,
            &reversal,
        );
        assert_eq!(event.event_type, EventType::PatchRollbackFailed);
        assert_eq!(event.meta("reversedIndices"), Some(&json!([2, 0])));
        assert_eq!(event.meta("trigger"), Some(&json!("automatic")));
    }
}
