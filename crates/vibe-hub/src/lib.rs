//! Vibe broadcast hub
//!
//! Owns every live observer connection: authentication handshake, channel
//! subscriptions, filtered fan-out of patch events and stale-connection
//! eviction. `server` exposes the hub and the patch engine over axum.

mod auth;
mod connection;
mod heartbeat;
mod hub;
pub mod protocol;
pub mod server;

pub use auth::{AllowAllAuthenticator, AuthOutcome, Authenticator, StaticTokenAuthenticator};
pub use connection::{AuthContext, ConnectionInfo, Delivery, Transport};
pub use heartbeat::spawn_heartbeat;
pub use hub::{
    BroadcastHub, BroadcastOptions, ChannelInfo, DisconnectReason, HubStats, LifecycleEvent,
};
pub use protocol::{Envelope, MessageType, Request};
pub use server::{AppState, SharedState};
