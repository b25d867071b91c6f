//! Periodic stale-connection sweep

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::hub::BroadcastHub;

/// Run `evict_stale` every `interval` until the runtime shuts down or the
/// handle is aborted
pub fn spawn_heartbeat(hub: Arc<BroadcastHub>, interval: Duration) -> JoinHandle<()> {
    info!("Heartbeat sweep every {:?}", interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let evicted = hub.evict_stale(Utc::now()).await;
            if evicted.is_empty() {
                debug!("Heartbeat: no stale connections");
            } else {
                info!("Heartbeat evicted {} stale connections", evicted.len());
            }
        }
    })
}
