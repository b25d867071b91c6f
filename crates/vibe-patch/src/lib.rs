//! Vibe patch engine
//!
//! Applies ordered batches of structured operations to resources through a
//! [`ResourceStore`], records every lifecycle step in an append-only
//! [`EventSink`], and reverses applied work on failure or on request.
//!
//! Batch status is never stored. It is derived on every query by folding the
//! batch's events in order (see [`derive_status`]).

pub mod document;
mod engine;
mod file_store;
pub mod pointer;
mod publisher;
mod rollback;
mod sink;
mod status;
mod store;

pub use engine::{ApplyError, ApplyErrorKind, ApplyOptions, ApplyResult, PatchEngine};
pub use file_store::{validate_resource_path, JsonFileStore};
pub use publisher::{batch_channel, EventPublisher, NoopPublisher, PATCH_EVENTS_CHANNEL};
pub use rollback::{pending_reversals, RollbackOutcome, RollbackRequest, RollbackTrigger};
pub use sink::{AppendFileEventSink, EventSink, MemoryEventSink};
pub use status::{derive_status, BatchStatus, Progress, StatusReport, StatusTracker};
pub use store::{MemoryDocumentStore, ResourceStore};
