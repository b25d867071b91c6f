//! Core type definitions for patch orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Result, VibeError};

/// Structured edit kinds (RFC 6902 operation names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "replace" => Ok(Self::Replace),
            "move" => Ok(Self::Move),
            "copy" => Ok(Self::Copy),
            "test" => Ok(Self::Test),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

/// One structured edit against a named resource.
///
/// `op` is kept as the raw wire string so that an unknown operation fails
/// validation for that operation only, instead of rejecting the whole batch
/// at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    pub file: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl PatchOperation {
    pub fn new(op: OpKind, file: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: op.to_string(),
            path: path.into(),
            file: file.into(),
            value: None,
            from: None,
        }
    }

    pub fn add(file: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Self::new(OpKind::Add, file, path).with_value(value)
    }

    pub fn remove(file: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(OpKind::Remove, file, path)
    }

    pub fn replace(file: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Self::new(OpKind::Replace, file, path).with_value(value)
    }

    pub fn move_from(
        file: impl Into<String>,
        from: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::new(OpKind::Move, file, path).with_from(from)
    }

    pub fn copy_from(
        file: impl Into<String>,
        from: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::new(OpKind::Copy, file, path).with_from(from)
    }

    pub fn test(file: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Self::new(OpKind::Test, file, path).with_value(value)
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Structural validation, independent of any resource.
    ///
    /// Only two rules live here: the op must be a known kind, and the path
    /// must be a non-empty pointer rooted at `/`. Anything semantic (missing
    /// target, wrong container type) is the resource store's call.
    pub fn validate(&self) -> Result<OpKind> {
        if self.op.is_empty() {
            return Err(VibeError::Validation("operation is empty".to_string()));
        }
        let kind = self
            .op
            .parse::<OpKind>()
            .map_err(VibeError::Validation)?;

        if self.path.is_empty() {
            return Err(VibeError::Validation("path is empty".to_string()));
        }
        if !self.path.starts_with('/') {
            return Err(VibeError::Validation(format!(
                "path must start with '/': {}",
                self.path
            )));
        }

        Ok(kind)
    }

    /// Parsed kind, without the path checks
    pub fn kind(&self) -> Result<OpKind> {
        self.op.parse::<OpKind>().map_err(VibeError::Validation)
    }
}

/// An ordered set of operations applied as one logical unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub patches: Vec<PatchOperation>,
    #[serde(default = "default_requester")]
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

fn default_requester() -> String {
    "agent".to_string()
}

impl PatchBatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            patches: Vec::new(),
            requester: default_requester(),
            reason: None,
            branch: None,
        }
    }

    /// Batch with no caller-supplied id; one is generated on apply
    pub fn anonymous() -> Self {
        Self {
            id: None,
            ..Self::new("")
        }
    }

    pub fn with_patch(mut self, op: PatchOperation) -> Self {
        self.patches.push(op);
        self
    }

    pub fn with_patches(mut self, ops: impl IntoIterator<Item = PatchOperation>) -> Self {
        self.patches.extend(ops);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    /// The caller-supplied id, or a freshly generated `patch-{uuid}`
    pub fn resolve_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("patch-{}", Uuid::new_v4()),
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

/// What an applied operation displaced.
///
/// `operation` is the operation as actually applied: array appends (`-`)
/// are rewritten to the concrete index they landed on. A displaced `null`
/// is `Some(Value::Null)` and stays distinct from "nothing displaced" on the
/// wire: the key is omitted for `None` and present for any value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    pub operation: PatchOperation,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub prior_value: Option<Value>,
    /// Value left at the target path, absent for `remove` and `test`
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_value: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl AppliedRecord {
    pub fn new(operation: PatchOperation, prior_value: Option<Value>) -> Self {
        Self {
            operation,
            prior_value,
            new_value: None,
        }
    }

    pub fn with_new_value(mut self, value: Value) -> Self {
        self.new_value = Some(value);
        self
    }

    /// Operations that undo this one, in the order they must run.
    ///
    /// `remove` and `replace` cannot be inverted without a pre-image and fail
    /// fast with `MissingPreImage`. `test` never mutated anything, so its
    /// inverse is empty.
    pub fn inverse(&self) -> Result<Vec<PatchOperation>> {
        let op = &self.operation;
        let file = op.file.clone();

        let inverse = match op.kind()? {
            OpKind::Add | OpKind::Copy => match &self.prior_value {
                Some(prior) => vec![PatchOperation::replace(file, &op.path, prior.clone())],
                None => vec![PatchOperation::remove(file, &op.path)],
            },
            OpKind::Remove => {
                let prior = self.require_prior()?;
                vec![PatchOperation::add(file, &op.path, prior)]
            }
            OpKind::Replace => {
                let prior = self.require_prior()?;
                vec![PatchOperation::replace(file, &op.path, prior)]
            }
            OpKind::Move => {
                let from = op.from.clone().ok_or_else(|| {
                    VibeError::Rollback(format!("move at {} has no 'from'", op.path))
                })?;
                let mut ops = vec![PatchOperation::move_from(file.clone(), &op.path, from)];
                if let Some(prior) = &self.prior_value {
                    ops.push(PatchOperation::add(file, &op.path, prior.clone()));
                }
                ops
            }
            OpKind::Test => Vec::new(),
        };

        Ok(inverse)
    }

    fn require_prior(&self) -> Result<Value> {
        self.prior_value
            .clone()
            .ok_or_else(|| VibeError::MissingPreImage {
                op: self.operation.op.clone(),
                path: self.operation.path.clone(),
            })
    }
}

/// Lifecycle event kinds recorded for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PatchProcessingStarted,
    PatchValidationCompleted,
    PatchOperationApplied,
    PatchOperationFailed,
    PatchRollbackCompleted,
    PatchRollbackFailed,
    PatchProcessingCompleted,
    PatchProcessingFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatchProcessingStarted => "PATCH_PROCESSING_STARTED",
            Self::PatchValidationCompleted => "PATCH_VALIDATION_COMPLETED",
            Self::PatchOperationApplied => "PATCH_OPERATION_APPLIED",
            Self::PatchOperationFailed => "PATCH_OPERATION_FAILED",
            Self::PatchRollbackCompleted => "PATCH_ROLLBACK_COMPLETED",
            Self::PatchRollbackFailed => "PATCH_ROLLBACK_FAILED",
            Self::PatchProcessingCompleted => "PATCH_PROCESSING_COMPLETED",
            Self::PatchProcessingFailed => "PATCH_PROCESSING_FAILED",
        }
    }

    /// Whether this event closes the batch lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PatchProcessingCompleted | Self::PatchProcessingFailed
        )
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::PatchRollbackCompleted | Self::PatchRollbackFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failure,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Immutable audit record. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEvent {
    pub id: String,
    pub patch_id: String,
    pub event_type: EventType,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl PatchEvent {
    pub fn new(
        patch_id: impl Into<String>,
        event_type: EventType,
        status: EventStatus,
        metadata: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            patch_id: patch_id.into(),
            event_type,
            status,
            created_at: Utc::now(),
            metadata,
        }
    }

    pub fn success(patch_id: impl Into<String>, event_type: EventType, metadata: Value) -> Self {
        Self::new(patch_id, event_type, EventStatus::Success, metadata)
    }

    pub fn failure(patch_id: impl Into<String>, event_type: EventType, metadata: Value) -> Self {
        Self::new(patch_id, event_type, EventStatus::Failure, metadata)
    }

    /// Read a metadata field
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}

/// Rollback handle for a batch: `rollback:{batchId}`.
///
/// Deterministic, so the operations it covers can always be recovered by
/// replaying the event log for the batch; no side table is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollbackId(String);

impl RollbackId {
    const PREFIX: &'static str = "rollback:";

    pub fn for_batch(batch_id: &str) -> Self {
        Self(format!("{}{}", Self::PREFIX, batch_id))
    }

    /// Batch id this rollback handle refers to
    pub fn batch_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(Self::PREFIX)
            .filter(|id| !id.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RollbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RollbackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RollbackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_op_kind_parsing() {
        assert_eq!("add".parse::<OpKind>().unwrap(), OpKind::Add);
        assert_eq!("test".parse::<OpKind>().unwrap(), OpKind::Test);
        assert!("replace-block".parse::<OpKind>().is_err());
        assert!("ADD".parse::<OpKind>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_operations() {
        let mut op = PatchOperation::add("f", "/a", json!(1));
        assert_eq!(op.validate().unwrap(), OpKind::Add);

        op.op = String::new();
        assert!(matches!(op.validate(), Err(VibeError::Validation(_))));

        op.op = "frobnicate".to_string();
        assert!(op.validate().is_err());

        let op = PatchOperation::remove("f", "a");
        assert!(op.validate().is_err());

        let op = PatchOperation::remove("f", "");
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_batch_deserializes_with_unknown_op() {
        let batch: PatchBatch = serde_json::from_value(json!({
            "id": "b1",
            "patches": [
                {"op": "add", "path": "/a", "file": "f", "value": "1"},
                {"op": "bogus", "path": "/b", "file": "f"}
            ]
        }))
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.requester, "agent");
        assert!(batch.patches[0].validate().is_ok());
        assert!(batch.patches[1].validate().is_err());
    }

    #[test]
    fn test_resolve_id_generates_when_missing() {
        let batch = PatchBatch::anonymous();
        let id = batch.resolve_id();
        assert!(id.starts_with("patch-"));

        let batch = PatchBatch::new("b1");
        assert_eq!(batch.resolve_id(), "b1");
    }

    #[test]
    fn test_inverse_of_add_without_prior_is_remove() {
        let record = AppliedRecord::new(PatchOperation::add("f", "/a", json!("1")), None);
        let inverse = record.inverse().unwrap();
        assert_eq!(inverse, vec![PatchOperation::remove("f", "/a")]);
    }

    #[test]
    fn test_inverse_of_add_over_existing_restores_prior() {
        let record = AppliedRecord::new(
            PatchOperation::add("f", "/a", json!("new")),
            Some(json!("old")),
        );
        let inverse = record.inverse().unwrap();
        assert_eq!(inverse, vec![PatchOperation::replace("f", "/a", json!("old"))]);
    }

    #[test]
    fn test_inverse_requires_pre_image_for_remove_and_replace() {
        let record = AppliedRecord::new(PatchOperation::remove("f", "/a"), None);
        assert!(matches!(
            record.inverse(),
            Err(VibeError::MissingPreImage { .. })
        ));

        let record = AppliedRecord::new(PatchOperation::replace("f", "/a", json!(2)), None);
        assert!(matches!(
            record.inverse(),
            Err(VibeError::MissingPreImage { .. })
        ));

        let record = AppliedRecord::new(PatchOperation::remove("f", "/a"), Some(json!(1)));
        assert_eq!(
            record.inverse().unwrap(),
            vec![PatchOperation::add("f", "/a", json!(1))]
        );
    }

    #[test]
    fn test_inverse_of_move_moves_back_and_restores_overwritten() {
        let record = AppliedRecord::new(
            PatchOperation::move_from("f", "/a", "/b"),
            Some(json!("clobbered")),
        );
        let inverse = record.inverse().unwrap();
        assert_eq!(
            inverse,
            vec![
                PatchOperation::move_from("f", "/b", "/a"),
                PatchOperation::add("f", "/b", json!("clobbered")),
            ]
        );
    }

    #[test]
    fn test_inverse_of_test_is_empty() {
        let record = AppliedRecord::new(PatchOperation::test("f", "/a", json!(1)), None);
        assert!(record.inverse().unwrap().is_empty());
    }

    #[test]
    fn test_displaced_null_survives_serialization() {
        let record = AppliedRecord::new(PatchOperation::replace("a.json", "/a", json!(1)), Some(Value::Null));
        let wire = serde_json::to_value(&record).unwrap();
        assert_eq!(wire["priorValue"], Value::Null);
        assert!(wire.as_object().unwrap().contains_key("priorValue"));

        let back: AppliedRecord = serde_json::from_value(wire).unwrap();
        assert_eq!(back.prior_value, Some(Value::Null));
        assert_eq!(
            back.inverse().unwrap(),
            vec![PatchOperation::replace("a.json", "/a", Value::Null)]
        );

        let op: PatchOperation =
            serde_json::from_str(r#"{"op":"add","path":"/a","file":"a.json","value":null}"#).unwrap();
        assert_eq!(op.value, Some(Value::Null));

        let nothing = AppliedRecord::new(PatchOperation::add("a.json", "/b", json!(1)), None);
        let back: AppliedRecord = serde_json::from_value(serde_json::to_value(&nothing).unwrap()).unwrap();
        assert_eq!(back.prior_value, None);
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::PatchOperationApplied).unwrap();
        assert_eq!(json, "\"PATCH_OPERATION_APPLIED\"");
        assert!(EventType::PatchProcessingFailed.is_terminal());
        assert!(!EventType::PatchRollbackCompleted.is_terminal());
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = PatchEvent::success("b1", EventType::PatchProcessingStarted, json!({"operationCount": 2}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["patchId"], "b1");
        assert_eq!(value["eventType"], "PATCH_PROCESSING_STARTED");
        assert_eq!(value["status"], "success");
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn test_rollback_id_round_trip() {
        let id = RollbackId::for_batch("b1");
        assert_eq!(id.as_str(), "rollback:b1");
        assert_eq!(id.batch_id(), Some("b1"));

        assert_eq!(RollbackId::from("b1").batch_id(), None);
        assert_eq!(RollbackId::from("rollback:").batch_id(), None);
    }
}
