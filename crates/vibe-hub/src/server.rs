//! Axum HTTP/WebSocket server
//!
//! `/ws` bridges each socket to the hub: one task owns the socket and
//! selects between inbound frames (fed to `handle_message`) and the
//! connection's outbound queue. REST routes are thin wrappers over the
//! patch engine.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use vibe_core::PatchBatch;
use vibe_patch::{ApplyOptions, ApplyResult, PatchEngine, RollbackOutcome, RollbackRequest, StatusReport};

use crate::connection::Transport;
use crate::hub::{BroadcastHub, HubStats};

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub engine: PatchEngine,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

pub type SharedState = Arc<AppState>;

/// Body of `POST /api/patches`
#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub batch: PatchBatch,
    #[serde(default)]
    pub options: ApplyOptions,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/patches", post(apply_patches))
        .route("/api/patches/rollback", post(rollback_patch))
        .route("/api/patches/:id/status", get(patch_status))
        .route("/api/hub/stats", get(hub_stats))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(state: SharedState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Vibe hub listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// GET /ws
async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(mut socket: WebSocket, app: SharedState) {
    let (transport, mut outbound) = Transport::channel(app.outbound_buffer);
    let id = app.hub.register(transport, None).await;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame from {}", id);
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        debug!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                };

                if let Err(e) = app.hub.handle_message(&id, &text).await {
                    // Evicted while the frame was in flight
                    warn!("Dropping frame for {}: {}", id, e);
                    break;
                }
            }
            msg = outbound.recv() => {
                // None: the hub dropped this connection
                let Some(frame) = msg else { break };
                match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(WsMessage::Text(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        debug!("WebSocket send failed or timed out for {}", id);
                        break;
                    }
                }
            }
        }
    }

    app.hub.unregister(&id).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

/// POST /api/patches
async fn apply_patches(
    State(app): State<SharedState>,
    Json(request): Json<ApplyRequest>,
) -> Json<ApplyResult> {
    Json(app.engine.apply_patches(&request.batch, request.options).await)
}

/// GET /api/patches/:id/status
async fn patch_status(
    State(app): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, StatusCode> {
    match app.engine.get_patch_status(&id).await {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Status query for {} failed: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/patches/rollback
async fn rollback_patch(
    State(app): State<SharedState>,
    Json(request): Json<RollbackRequest>,
) -> Json<RollbackOutcome> {
    Json(app.engine.rollback_patch(request).await)
}

/// GET /api/hub/stats
async fn hub_stats(State(app): State<SharedState>) -> Json<HubStats> {
    Json(app.hub.stats().await)
}

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vibe-hub"
    }))
}
