//! Outbound seam from the engine to live observers

use async_trait::async_trait;
use vibe_core::PatchEvent;

/// Channel every patch event is published on
pub const PATCH_EVENTS_CHANNEL: &str = "patch-events";

/// Per-batch channel name: `patch-{batchId}`
pub fn batch_channel(patch_id: &str) -> String {
    format!("patch-{}", patch_id)
}

/// Receives events right after they are persisted.
///
/// Delivery is best-effort: publishing cannot fail the batch, so the method
/// has no error to return.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &PatchEvent);
}

/// Publisher for offline runs with no observers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: &PatchEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_channel_name() {
        assert_eq!(batch_channel("b1"), "patch-b1");
    }
}
