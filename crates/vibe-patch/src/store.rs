//! Resource store abstraction
//!
//! The engine never touches resources directly. It hands one operation at a
//! time to a `ResourceStore`, which applies it and returns an `AppliedRecord`
//! carrying the pre-image needed to reverse it later.
//!
//! Cross-batch isolation is NOT provided by the engine: two batches touching
//! the same resource must be serialized by the caller or by the store.
//! `MemoryDocumentStore` does this trivially with a single write lock.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use vibe_core::{AppliedRecord, PatchOperation, Result, VibeError};

use crate::document;

/// Applies and reverses single structured operations (allows mocking in tests)
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Apply an operation, capturing whatever it displaced
    async fn apply(&self, op: &PatchOperation) -> Result<AppliedRecord>;

    /// Undo a previously applied operation
    async fn reverse(&self, record: &AppliedRecord) -> Result<()>;

    /// Check an operation against the current state without mutating anything
    async fn dry_run(&self, op: &PatchOperation) -> Result<AppliedRecord>;
}

/// In-memory JSON documents keyed by resource id
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document (builder form, before the store is shared)
    pub fn with_document(mut self, name: impl Into<String>, doc: Value) -> Self {
        self.documents.get_mut().insert(name.into(), doc);
        self
    }

    pub async fn insert_document(&self, name: impl Into<String>, doc: Value) {
        self.documents.write().await.insert(name.into(), doc);
    }

    /// Current contents of a document
    pub async fn document(&self, name: &str) -> Option<Value> {
        self.documents.read().await.get(name).cloned()
    }

    /// Value at a pointer inside a document
    pub async fn value_at(&self, name: &str, pointer: &str) -> Option<Value> {
        let docs = self.documents.read().await;
        docs.get(name)
            .and_then(|doc| document::get(doc, pointer))
            .cloned()
    }
}

#[async_trait]
impl ResourceStore for MemoryDocumentStore {
    #[instrument(skip(self, op), fields(file = %op.file, op = %op.op, path = %op.path))]
    async fn apply(&self, op: &PatchOperation) -> Result<AppliedRecord> {
        let mut docs = self.documents.write().await;
        let doc = docs
            .get_mut(&op.file)
            .ok_or_else(|| VibeError::DocumentNotFound(op.file.clone()))?;

        let record = document::apply(doc, op)?;
        debug!("Applied {} to {}", op.op, op.file);
        Ok(record)
    }

    #[instrument(skip(self, record), fields(file = %record.operation.file, path = %record.operation.path))]
    async fn reverse(&self, record: &AppliedRecord) -> Result<()> {
        let inverse = record.inverse()?;

        let mut docs = self.documents.write().await;
        let doc = docs
            .get_mut(&record.operation.file)
            .ok_or_else(|| VibeError::DocumentNotFound(record.operation.file.clone()))?;

        // Work on a scratch copy so a multi-step inverse lands all-or-nothing.
        let mut scratch = doc.clone();
        for op in &inverse {
            document::apply(&mut scratch, op)?;
        }
        *doc = scratch;

        debug!("Reversed {} on {}", record.operation.op, record.operation.file);
        Ok(())
    }

    async fn dry_run(&self, op: &PatchOperation) -> Result<AppliedRecord> {
        let docs = self.documents.read().await;
        let doc = docs
            .get(&op.file)
            .ok_or_else(|| VibeError::DocumentNotFound(op.file.clone()))?;

        let mut scratch = doc.clone();
        document::apply(&mut scratch, op)
    }
}
