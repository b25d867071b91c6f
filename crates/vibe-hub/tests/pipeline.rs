//! Integration tests for the engine -> hub pipeline.
//!
//! A batch is applied against JSON files on disk with a JSONL event log,
//! and the hub fans each event out to subscribed connections.

use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use vibe_core::{PatchBatch, PatchOperation};
use vibe_hub::{AllowAllAuthenticator, BroadcastHub, Transport};
use vibe_patch::{
    AppendFileEventSink, ApplyOptions, BatchStatus, EventPublisher, JsonFileStore, PatchEngine,
    RollbackRequest,
};

struct Fixture {
    dir: TempDir,
    hub: Arc<BroadcastHub>,
    engine: PatchEngine,
}

fn fixture(doc: Value) -> Fixture {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("app.json"), doc.to_string()).unwrap();

    let hub = Arc::new(BroadcastHub::new(Arc::new(AllowAllAuthenticator)));
    let publisher: Arc<dyn EventPublisher> = hub.clone();
    let engine = PatchEngine::new(
        Arc::new(JsonFileStore::new(dir.path())),
        Arc::new(AppendFileEventSink::new(dir.path().join(".vibe/events.jsonl"))),
    )
    .with_publisher(publisher);

    Fixture { dir, hub, engine }
}

fn read_doc(fx: &Fixture) -> Value {
    let content = std::fs::read_to_string(fx.dir.path().join("app.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

/// Connect, authenticate and subscribe; swallows the two acks
async fn subscriber(hub: &BroadcastHub, channel: &str) -> mpsc::Receiver<String> {
    let (transport, mut rx) = Transport::channel(64);
    let id = hub.register(transport, None).await;

    hub.handle_message(&id, r#"{"id":"1","type":"auth","payload":{"token":"t"}}"#)
        .await
        .unwrap();
    let frame = json!({"id": "2", "type": "subscribe", "payload": {"channels": [channel]}});
    hub.handle_message(&id, &frame.to_string()).await.unwrap();

    for _ in 0..2 {
        let ack: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(ack["type"], "ack");
    }
    rx
}

fn drain_event_types(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut types = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["type"], "event");
        types.push(frame["payload"]["eventType"].as_str().unwrap().to_string());
    }
    types
}

#[tokio::test]
async fn test_successful_batch_is_broadcast_in_order() {
    let fx = fixture(json!({}));
    let mut all = subscriber(&fx.hub, "patch-events").await;
    let mut mine = subscriber(&fx.hub, "patch-b1").await;
    let mut other = subscriber(&fx.hub, "patch-b2").await;

    let batch = PatchBatch::new("b1")
        .with_patch(PatchOperation::add("app.json", "/a", json!("1")))
        .with_patch(PatchOperation::add("app.json", "/b", json!("2")));
    let result = fx.engine.apply_patches(&batch, ApplyOptions::default()).await;

    assert!(result.success);
    assert_eq!(result.applied_count, 2);
    assert_eq!(result.events.len(), 4);
    assert_eq!(read_doc(&fx), json!({"a": "1", "b": "2"}));

    let expected = vec![
        "PATCH_PROCESSING_STARTED",
        "PATCH_OPERATION_APPLIED",
        "PATCH_OPERATION_APPLIED",
        "PATCH_PROCESSING_COMPLETED",
    ];
    assert_eq!(drain_event_types(&mut all), expected);
    assert_eq!(drain_event_types(&mut mine), expected);
    assert!(drain_event_types(&mut other).is_empty());
}

#[tokio::test]
async fn test_failed_batch_leaves_files_unchanged() {
    let fx = fixture(json!({"a": 0}));
    let mut all = subscriber(&fx.hub, "patch-events").await;

    let batch = PatchBatch::new("b2")
        .with_patch(PatchOperation::replace("app.json", "/a", json!(1)))
        .with_patch(PatchOperation::remove("app.json", "/missing"));
    let result = fx.engine.apply_patches(&batch, ApplyOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.applied_count, 1);
    assert_eq!(result.failed_count, 1);
    assert_eq!(read_doc(&fx), json!({"a": 0}));

    assert_eq!(
        drain_event_types(&mut all),
        vec![
            "PATCH_PROCESSING_STARTED",
            "PATCH_OPERATION_APPLIED",
            "PATCH_OPERATION_FAILED",
            "PATCH_ROLLBACK_COMPLETED",
            "PATCH_PROCESSING_FAILED",
        ]
    );

    let status = fx.engine.get_patch_status("b2").await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Failed);
    assert!(status.rolled_back);
}

#[tokio::test]
async fn test_manual_rollback_replays_persisted_log() {
    let fx = fixture(json!({"items": []}));

    let batch = PatchBatch::new("b3")
        .with_patch(PatchOperation::add("app.json", "/items/-", json!("x")))
        .with_patch(PatchOperation::add("app.json", "/owner", json!("agent")));
    let result = fx.engine.apply_patches(&batch, ApplyOptions::default()).await;
    assert!(result.success);

    // A second engine over the same files sees only what the log recorded
    let fresh = PatchEngine::new(
        Arc::new(JsonFileStore::new(fx.dir.path())),
        Arc::new(AppendFileEventSink::new(fx.dir.path().join(".vibe/events.jsonl"))),
    );
    let mut all = subscriber(&fx.hub, "patch-events").await;
    let outcome = fresh
        .rollback_patch(RollbackRequest::new(result.rollback_id.unwrap()).with_reason("revert"))
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.reversed, vec![1, 0]);
    assert_eq!(read_doc(&fx), json!({"items": []}));
    // `fresh` has no publisher wired to the hub
    assert!(drain_event_types(&mut all).is_empty());
}

#[tokio::test]
async fn test_dead_subscriber_does_not_block_others() {
    let fx = fixture(json!({}));
    let dead = subscriber(&fx.hub, "patch-events").await;
    let mut live = subscriber(&fx.hub, "patch-events").await;
    drop(dead);

    let batch = PatchBatch::new("b4").with_patch(PatchOperation::add("app.json", "/a", json!(1)));
    fx.engine.apply_patches(&batch, ApplyOptions::default()).await;

    assert_eq!(drain_event_types(&mut live).len(), 3);
    let stats = fx.hub.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.channels[0].subscribers, 1);
}
