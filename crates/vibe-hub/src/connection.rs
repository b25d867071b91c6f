//! Live connections and their outbound transport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// Outbound half of a connection: a bounded queue of serialized frames.
///
/// The socket writer task owns the receiving end. Dropping every `Transport`
/// clone closes the queue, which tells the writer to close the socket.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<String>,
}

/// Result of handing a frame to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; this frame was dropped
    Full,
    /// Receiver gone; the connection is dead
    Closed,
}

impl Transport {
    /// Transport plus the receiver the writer task drains
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Non-blocking send; one slow peer never stalls the caller
    pub fn try_deliver(&self, frame: String) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identity supplied at registration, which pre-authenticates the connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One live subscriber, owned by the hub
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub subscriptions: HashSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub(crate) transport: Transport,
}

impl Connection {
    pub(crate) fn new(id: String, transport: Transport, auth: Option<AuthContext>) -> Self {
        let now = Utc::now();
        let mut conn = Self {
            id,
            authenticated: false,
            user_id: None,
            session_id: None,
            subscriptions: HashSet::new(),
            connected_at: now,
            last_activity: now,
            metadata: None,
            transport,
        };

        if let Some(ctx) = auth {
            conn.authenticated = true;
            conn.user_id = ctx.user_id;
            conn.session_id = ctx.session_id;
            conn.metadata = ctx.metadata;
        }
        conn
    }

    pub fn info(&self) -> ConnectionInfo {
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();

        ConnectionInfo {
            id: self.id.clone(),
            authenticated: self.authenticated,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            subscriptions,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }
}

/// Serializable snapshot of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
