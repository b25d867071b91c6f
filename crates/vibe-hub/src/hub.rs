//! Connection registry and fan-out
//!
//! All shared state lives in one `Registry` behind one lock: the connection
//! table and the `channel -> connection ids` reverse index. Every mutation
//! updates both sides under the same write guard, so they cannot diverge.
//! Sends never happen under the lock: broadcast snapshots the matching
//! transports first, then delivers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vibe_core::{HubSettings, PatchEvent, Result, VibeError};
use vibe_patch::{batch_channel, EventPublisher, PATCH_EVENTS_CHANNEL};

use crate::auth::{AllowAllAuthenticator, Authenticator, StaticTokenAuthenticator};
use crate::connection::{AuthContext, Connection, ConnectionInfo, Delivery, Transport};
use crate::protocol::{Envelope, MessageType, Request};

const LIFECYCLE_CAPACITY: usize = 256;

/// Why a connection left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Closed,
    Stale,
    TransportFailed,
}

/// Registry lifecycle, observable via `subscribe_lifecycle`
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connected {
        connection_id: String,
    },
    Authenticated {
        connection_id: String,
        user_id: Option<String>,
    },
    Message {
        connection_id: String,
        kind: MessageType,
    },
    Disconnected {
        connection_id: String,
        reason: DisconnectReason,
    },
}

/// Filters for `broadcast`; every supplied filter must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOptions {
    #[serde(default)]
    pub exclude_connection: Option<String>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(default)]
    pub target_session_id: Option<String>,
    /// Connection must be subscribed to at least one of these
    #[serde(default)]
    pub channels: Option<Vec<String>>,
}

impl BroadcastOptions {
    pub fn channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: Some(channels.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn excluding(mut self, connection_id: impl Into<String>) -> Self {
        self.exclude_connection = Some(connection_id.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.target_session_id = Some(session_id.into());
        self
    }

    fn matches(&self, conn: &Connection) -> bool {
        if self.exclude_connection.as_deref() == Some(conn.id.as_str()) {
            return false;
        }
        if let Some(user) = &self.target_user_id {
            if conn.user_id.as_ref() != Some(user) {
                return false;
            }
        }
        if let Some(session) = &self.target_session_id {
            if conn.session_id.as_ref() != Some(session) {
                return false;
            }
        }
        if let Some(channels) = &self.channels {
            if !channels.iter().any(|c| conn.subscriptions.contains(c)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscribers: usize,
}

/// Registry snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    /// Sum of every connection's subscription count
    pub active_subscriptions: usize,
    pub channels: Vec<ChannelInfo>,
}

#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<String, Connection>,
    channels: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn subscribe(&mut self, id: &str, channel: &str) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        conn.subscriptions.insert(channel.to_string());
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    fn unsubscribe(&mut self, id: &str, channel: &str) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.subscriptions.remove(channel);
        }
        self.release(id, channel);
    }

    fn remove(&mut self, id: &str) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        for channel in &conn.subscriptions {
            self.release(id, channel);
        }
        Some(conn)
    }

    /// Drop `id` from a channel's subscriber set; the channel goes with its
    /// last subscriber
    fn release(&mut self, id: &str, channel: &str) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(id);
            if subscribers.is_empty() {
                self.channels.remove(channel);
            }
        }
    }
}

/// Owns every live connection and delivers frames to them
pub struct BroadcastHub {
    registry: RwLock<Registry>,
    authenticator: Arc<dyn Authenticator>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    require_auth: bool,
    stale_after: Duration,
}

impl BroadcastHub {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        let defaults = HubSettings::default();
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            registry: RwLock::new(Registry::default()),
            authenticator,
            lifecycle,
            require_auth: defaults.require_auth,
            stale_after: defaults.stale_after(),
        }
    }

    /// Hub configured from `[hub]` settings, using the static token table
    pub fn from_settings(settings: &HubSettings) -> Self {
        let authenticator: Arc<dyn Authenticator> = if settings.require_auth {
            Arc::new(StaticTokenAuthenticator::from_settings(settings))
        } else {
            Arc::new(AllowAllAuthenticator)
        };

        Self::new(authenticator)
            .with_require_auth(settings.require_auth)
            .with_stale_after(settings.stale_after())
    }

    pub fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    fn notify(&self, event: LifecycleEvent) {
        // No receivers is fine
        let _ = self.lifecycle.send(event);
    }

    /// Add a connection and return its id
    pub async fn register(&self, transport: Transport, auth: Option<AuthContext>) -> String {
        let id = Uuid::new_v4().to_string();
        let pre_authenticated = auth.is_some();
        let conn = Connection::new(id.clone(), transport, auth);
        let user_id = conn.user_id.clone();

        self.registry.write().await.connections.insert(id.clone(), conn);
        info!("Connection {} registered", id);

        self.notify(LifecycleEvent::Connected {
            connection_id: id.clone(),
        });
        if pre_authenticated {
            self.notify(LifecycleEvent::Authenticated {
                connection_id: id.clone(),
                user_id,
            });
        }
        id
    }

    /// Remove a connection and every subscription it held
    pub async fn unregister(&self, connection_id: &str) -> bool {
        self.remove(connection_id, DisconnectReason::Closed).await
    }

    async fn remove(&self, connection_id: &str, reason: DisconnectReason) -> bool {
        let removed = self.registry.write().await.remove(connection_id);
        if removed.is_none() {
            return false;
        }

        info!("Connection {} removed ({:?})", connection_id, reason);
        self.notify(LifecycleEvent::Disconnected {
            connection_id: connection_id.to_string(),
            reason,
        });
        true
    }

    /// Process one inbound frame from a connection.
    ///
    /// Protocol and auth problems are answered with an `error` frame to the
    /// sender only. The only error returned is an unknown connection id.
    #[instrument(skip(self, raw))]
    pub async fn handle_message(&self, connection_id: &str, raw: &str) -> Result<()> {
        {
            let mut registry = self.registry.write().await;
            let conn = registry
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| VibeError::ConnectionNotFound(connection_id.to_string()))?;
            conn.last_activity = Utc::now();
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Bad frame from {}: {}", connection_id, e);
                self.reply(connection_id, Envelope::error(None, e.to_string()))
                    .await;
                return Ok(());
            }
        };

        self.notify(LifecycleEvent::Message {
            connection_id: connection_id.to_string(),
            kind: envelope.kind,
        });

        let request = match Request::from_envelope(&envelope) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejected {} frame from {}: {}", envelope.kind, connection_id, e);
                self.reply(connection_id, Envelope::error(Some(&envelope.id), e.to_string()))
                    .await;
                return Ok(());
            }
        };

        let reply = match request {
            Request::Auth { token } => self.authenticate(connection_id, &envelope.id, &token).await,
            Request::Subscribe { channels } => {
                self.subscribe(connection_id, &envelope.id, channels).await
            }
            Request::Unsubscribe { channels } => {
                self.unsubscribe(connection_id, &envelope.id, channels)
                    .await
            }
            Request::Data(_) => Envelope::ack(&envelope.id, json!({ "received": true })),
        };

        self.reply(connection_id, reply).await;
        Ok(())
    }

    async fn authenticate(&self, connection_id: &str, request_id: &str, token: &str) -> Envelope {
        let outcome = match self.authenticator.verify(token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Authenticator failed for {}: {}", connection_id, e);
                return Envelope::error(Some(request_id), "authentication unavailable");
            }
        };

        if !outcome.ok {
            info!("Authentication rejected for {}", connection_id);
            return Envelope::error(Some(request_id), "authentication failed");
        }

        {
            let mut registry = self.registry.write().await;
            let Some(conn) = registry.connections.get_mut(connection_id) else {
                return Envelope::error(Some(request_id), "connection closed");
            };
            conn.authenticated = true;
            conn.user_id = outcome.user_id.clone();
            conn.session_id = outcome.session_id.clone();
        }

        info!("Connection {} authenticated", connection_id);
        self.notify(LifecycleEvent::Authenticated {
            connection_id: connection_id.to_string(),
            user_id: outcome.user_id.clone(),
        });

        Envelope::ack(
            request_id,
            json!({
                "authenticated": true,
                "userId": outcome.user_id,
                "sessionId": outcome.session_id,
            }),
        )
    }

    async fn subscribe(&self, connection_id: &str, request_id: &str, channels: Vec<String>) -> Envelope {
        let mut registry = self.registry.write().await;

        let authenticated = registry
            .connections
            .get(connection_id)
            .map(|c| c.authenticated)
            .unwrap_or(false);
        if self.require_auth && !authenticated {
            return Envelope::error(Some(request_id), "not authenticated");
        }

        for channel in &channels {
            registry.subscribe(connection_id, channel);
        }
        debug!("{} subscribed to {:?}", connection_id, channels);

        Envelope::ack(request_id, json!({ "subscribed": channels }))
    }

    async fn unsubscribe(&self, connection_id: &str, request_id: &str, channels: Vec<String>) -> Envelope {
        let mut registry = self.registry.write().await;
        for channel in &channels {
            registry.unsubscribe(connection_id, channel);
        }
        debug!("{} unsubscribed from {:?}", connection_id, channels);

        Envelope::ack(request_id, json!({ "unsubscribed": channels }))
    }

    async fn reply(&self, connection_id: &str, envelope: Envelope) {
        if let Err(e) = self.send_to(connection_id, &envelope).await {
            debug!("Reply to {} not delivered: {}", connection_id, e);
        }
    }

    /// Unicast. A closed transport removes the connection.
    pub async fn send_to(&self, connection_id: &str, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        let transport = self
            .registry
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|c| c.transport.clone())
            .ok_or_else(|| VibeError::ConnectionNotFound(connection_id.to_string()))?;

        match transport.try_deliver(frame) {
            Delivery::Sent => Ok(()),
            Delivery::Full => {
                warn!("Outbound buffer full for {}, frame dropped", connection_id);
                Err(VibeError::Transport(format!(
                    "outbound buffer full for {}",
                    connection_id
                )))
            }
            Delivery::Closed => {
                self.remove(connection_id, DisconnectReason::TransportFailed)
                    .await;
                Err(VibeError::Transport(format!(
                    "connection {} is closed",
                    connection_id
                )))
            }
        }
    }

    /// Deliver to every connection matching all filters; returns how many
    /// connections received the frame
    pub async fn broadcast(&self, envelope: &Envelope, options: &BroadcastOptions) -> usize {
        let frame = match envelope.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not serialize broadcast {}: {}", envelope.id, e);
                return 0;
            }
        };

        let targets: Vec<(String, Transport)> = {
            let registry = self.registry.read().await;

            let candidates: Vec<&Connection> = match &options.channels {
                Some(channels) => {
                    let ids: HashSet<&String> = channels
                        .iter()
                        .filter_map(|c| registry.channels.get(c))
                        .flatten()
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| registry.connections.get(id))
                        .collect()
                }
                None => registry.connections.values().collect(),
            };

            candidates
                .into_iter()
                .filter(|c| options.matches(c))
                .map(|c| (c.id.clone(), c.transport.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, transport) in targets {
            match transport.try_deliver(frame.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Full => warn!("Outbound buffer full for {}, frame dropped", id),
                Delivery::Closed => dead.push(id),
            }
        }

        for id in dead {
            self.remove(&id, DisconnectReason::TransportFailed).await;
        }

        debug!("Broadcast {} delivered to {} connections", envelope.id, delivered);
        delivered
    }

    /// Remove every connection idle longer than the staleness threshold.
    ///
    /// Dropping a connection drops its transport, which closes the socket.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let threshold = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let stale: Vec<String> = {
            let mut registry = self.registry.write().await;
            let ids: Vec<String> = registry
                .connections
                .values()
                .filter(|c| now - c.last_activity > threshold)
                .map(|c| c.id.clone())
                .collect();
            for id in &ids {
                registry.remove(id);
            }
            ids
        };

        for id in &stale {
            info!("Evicted stale connection {}", id);
            self.notify(LifecycleEvent::Disconnected {
                connection_id: id.clone(),
                reason: DisconnectReason::Stale,
            });
        }
        stale
    }

    pub async fn stats(&self) -> HubStats {
        let registry = self.registry.read().await;

        let mut channels: Vec<ChannelInfo> = registry
            .channels
            .iter()
            .map(|(name, subscribers)| ChannelInfo {
                name: name.clone(),
                subscribers: subscribers.len(),
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        HubStats {
            total_connections: registry.connections.len(),
            authenticated_connections: registry
                .connections
                .values()
                .filter(|c| c.authenticated)
                .count(),
            active_subscriptions: registry
                .connections
                .values()
                .map(|c| c.subscriptions.len())
                .sum(),
            channels,
        }
    }

    pub async fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.registry
            .read()
            .await
            .connections
            .get(connection_id)
            .map(Connection::info)
    }

    #[cfg(test)]
    async fn set_last_activity(&self, connection_id: &str, at: DateTime<Utc>) {
        if let Some(conn) = self.registry.write().await.connections.get_mut(connection_id) {
            conn.last_activity = at;
        }
    }
}

#[async_trait]
impl EventPublisher for BroadcastHub {
    async fn publish(&self, event: &PatchEvent) {
        let envelope = match Envelope::event(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Could not encode {} for {}: {}", event.event_type, event.patch_id, e);
                return;
            }
        };

        let options = BroadcastOptions::channels([
            PATCH_EVENTS_CHANNEL.to_string(),
            batch_channel(&event.patch_id),
        ]);
        let delivered = self.broadcast(&envelope, &options).await;
        debug!(
            "Published {} for {} to {} connections",
            event.event_type, event.patch_id, delivered
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use vibe_core::EventType;

    fn open_hub() -> BroadcastHub {
        BroadcastHub::new(Arc::new(AllowAllAuthenticator))
    }

    async fn connect(hub: &BroadcastHub) -> (String, mpsc::Receiver<String>) {
        let (transport, rx) = Transport::channel(16);
        let id = hub.register(transport, None).await;
        (id, rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> Option<Value> {
        rx.try_recv().ok().map(|f| serde_json::from_str(&f).unwrap())
    }

    async fn auth_and_subscribe(hub: &BroadcastHub, id: &str, rx: &mut mpsc::Receiver<String>, channel: &str) {
        hub.handle_message(id, r#"{"id":"a","type":"auth","payload":{"token":"t"}}"#)
            .await
            .unwrap();
        assert_eq!(next_frame(rx).unwrap()["type"], "ack");

        let frame = json!({"id": "s", "type": "subscribe", "payload": {"channels": [channel]}});
        hub.handle_message(id, &frame.to_string()).await.unwrap();
        assert_eq!(next_frame(rx).unwrap()["type"], "ack");
    }

    #[tokio::test]
    async fn test_subscribe_requires_auth() {
        let hub = open_hub();
        let (id, mut rx) = connect(&hub).await;

        hub.handle_message(&id, r#"{"id":"1","type":"subscribe","payload":{"channel":"x"}}"#)
            .await
            .unwrap();
        let reply = next_frame(&mut rx).unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["id"], "1");
        assert_eq!(hub.stats().await.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_rejected_token_keeps_connection_unauthenticated() {
        let hub = BroadcastHub::new(Arc::new(StaticTokenAuthenticator::default()));
        let (id, mut rx) = connect(&hub).await;

        hub.handle_message(&id, r#"{"id":"1","type":"auth","payload":{"token":"nope"}}"#)
            .await
            .unwrap();
        assert_eq!(next_frame(&mut rx).unwrap()["type"], "error");
        assert!(!hub.connection(&id).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_malformed_frames_reply_to_sender_only() {
        let hub = open_hub();
        let (a, mut rx_a) = connect(&hub).await;
        let (_b, mut rx_b) = connect(&hub).await;

        hub.handle_message(&a, "{{{").await.unwrap();
        hub.handle_message(&a, r#"{"id":"9","type":"event","payload":{}}"#)
            .await
            .unwrap();

        assert_eq!(next_frame(&mut rx_a).unwrap()["type"], "error");
        assert_eq!(next_frame(&mut rx_a).unwrap()["id"], "9");
        assert!(next_frame(&mut rx_b).is_none());
        assert_eq!(hub.stats().await.total_connections, 2);
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let hub = open_hub();
        let result = hub.handle_message("ghost", "{}").await;
        assert!(matches!(result, Err(VibeError::ConnectionNotFound(_))));
    }

    #[tokio::test]
    async fn test_channel_filtered_broadcast() {
        let hub = open_hub();
        let (a, mut rx_a) = connect(&hub).await;
        let (b, mut rx_b) = connect(&hub).await;
        let (_c, mut rx_c) = connect(&hub).await;
        auth_and_subscribe(&hub, &a, &mut rx_a, "X").await;
        auth_and_subscribe(&hub, &b, &mut rx_b, "Y").await;

        let envelope = Envelope::new(MessageType::Event, json!({"n": 1}));
        let delivered = hub.broadcast(&envelope, &BroadcastOptions::channels(["X"])).await;

        assert_eq!(delivered, 1);
        assert_eq!(next_frame(&mut rx_a).unwrap()["payload"]["n"], 1);
        assert!(next_frame(&mut rx_b).is_none());
        assert!(next_frame(&mut rx_c).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_filters_intersect() {
        let hub = open_hub();
        let (t1, _rx1) = Transport::channel(8);
        let (t2, mut rx2) = Transport::channel(8);
        let (t3, mut rx3) = Transport::channel(8);
        let ctx = |user: &str| AuthContext {
            user_id: Some(user.to_string()),
            ..Default::default()
        };
        let one = hub.register(t1, Some(ctx("alice"))).await;
        let _two = hub.register(t2, Some(ctx("alice"))).await;
        let _three = hub.register(t3, Some(ctx("bob"))).await;

        let envelope = Envelope::new(MessageType::Event, json!({}));
        let options = BroadcastOptions::default().for_user("alice").excluding(&one);
        assert_eq!(hub.broadcast(&envelope, &options).await, 1);
        assert!(next_frame(&mut rx2).is_some());
        assert!(next_frame(&mut rx3).is_none());

        // Channel filter AND user filter: alice is not subscribed anywhere
        let options = BroadcastOptions::channels(["X"]).for_user("alice");
        assert_eq!(hub.broadcast(&envelope, &options).await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_unregister_collect_channels() {
        let hub = open_hub();
        let (a, mut rx_a) = connect(&hub).await;
        let (b, mut rx_b) = connect(&hub).await;
        auth_and_subscribe(&hub, &a, &mut rx_a, "X").await;
        auth_and_subscribe(&hub, &b, &mut rx_b, "X").await;

        let stats = hub.stats().await;
        assert_eq!(stats.channels, vec![ChannelInfo { name: "X".to_string(), subscribers: 2 }]);

        hub.handle_message(&a, r#"{"id":"u","type":"unsubscribe","payload":{"channel":"X"}}"#)
            .await
            .unwrap();
        assert_eq!(hub.stats().await.channels[0].subscribers, 1);

        assert!(hub.unregister(&b).await);
        assert!(!hub.unregister(&b).await);
        let stats = hub.stats().await;
        assert!(stats.channels.is_empty());
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.authenticated_connections, 1);
    }

    #[tokio::test]
    async fn test_closed_transport_is_removed() {
        let hub = open_hub();
        let (id, rx) = connect(&hub).await;
        drop(rx);

        let envelope = Envelope::new(MessageType::Event, json!({}));
        let result = hub.send_to(&id, &envelope).await;
        assert!(matches!(result, Err(VibeError::Transport(_))));
        assert!(hub.connection(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_full_transport_drops_frame_but_keeps_connection() {
        let hub = open_hub();
        let (transport, _rx) = Transport::channel(1);
        let id = hub.register(transport, Some(AuthContext::default())).await;

        let envelope = Envelope::new(MessageType::Event, json!({}));
        assert_eq!(hub.broadcast(&envelope, &BroadcastOptions::default()).await, 1);
        assert_eq!(hub.broadcast(&envelope, &BroadcastOptions::default()).await, 0);
        assert!(hub.connection(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let hub = open_hub().with_stale_after(Duration::from_secs(300));
        let (stale, mut rx_stale) = connect(&hub).await;
        let (fresh, _rx_fresh) = connect(&hub).await;
        auth_and_subscribe(&hub, &stale, &mut rx_stale, "X").await;

        let now = Utc::now();
        hub.set_last_activity(&stale, now - chrono::Duration::seconds(301))
            .await;

        let mut lifecycle = hub.subscribe_lifecycle();
        let evicted = hub.evict_stale(now).await;

        assert_eq!(evicted, vec![stale.clone()]);
        assert!(hub.connection(&stale).await.is_none());
        assert!(hub.connection(&fresh).await.is_some());
        assert!(hub.stats().await.channels.is_empty());
        assert_eq!(
            lifecycle.recv().await.unwrap(),
            LifecycleEvent::Disconnected {
                connection_id: stale,
                reason: DisconnectReason::Stale,
            }
        );
    }

    #[tokio::test]
    async fn test_lifecycle_stream() {
        let hub = open_hub();
        let mut lifecycle = hub.subscribe_lifecycle();

        let (id, _rx) = connect(&hub).await;
        hub.handle_message(&id, r#"{"id":"d","type":"data","payload":{"x":1}}"#)
            .await
            .unwrap();
        hub.unregister(&id).await;

        assert!(matches!(lifecycle.recv().await.unwrap(), LifecycleEvent::Connected { .. }));
        assert_eq!(
            lifecycle.recv().await.unwrap(),
            LifecycleEvent::Message {
                connection_id: id.clone(),
                kind: MessageType::Data,
            }
        );
        assert!(matches!(
            lifecycle.recv().await.unwrap(),
            LifecycleEvent::Disconnected {
                reason: DisconnectReason::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_publish_targets_patch_channels() {
        let hub = open_hub();
        let (all, mut rx_all) = connect(&hub).await;
        let (one, mut rx_one) = connect(&hub).await;
        let (other, mut rx_other) = connect(&hub).await;
        auth_and_subscribe(&hub, &all, &mut rx_all, PATCH_EVENTS_CHANNEL).await;
        auth_and_subscribe(&hub, &one, &mut rx_one, "patch-b1").await;
        auth_and_subscribe(&hub, &other, &mut rx_other, "patch-b2").await;

        let event = PatchEvent::success("b1", EventType::PatchProcessingStarted, json!({}));
        hub.publish(&event).await;

        let frame = next_frame(&mut rx_all).unwrap();
        assert_eq!(frame["type"], "event");
        assert_eq!(frame["payload"]["eventType"], "PATCH_PROCESSING_STARTED");
        assert!(next_frame(&mut rx_one).is_some());
        assert!(next_frame(&mut rx_other).is_none());
    }
}
