//! Notification hub: topic rooms and real-time event fanout.
//!
//! The hub keeps an explicit membership table (topic → connections and
//! connection → topics) and one bounded channel per connection. Transports
//! (the WebSocket handler in `jotter-api`) drain a connection's receiver;
//! tests can drain it directly without any transport.
//!
//! Delivery is best-effort and at-most-once: events for a connection whose
//! buffer is full, or whose receiver is gone, are dropped. There is no
//! replay; clients reconcile by querying the persisted request.
//!
//! ## Wire Format
//!
//! ```text
//! {"event":"request:complete","data":{"requestId":"...","spaceId":"...","type":"INPUT","result":{...}}}
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::Error;
use crate::models::{RequestStatus, RequestType};

/// Identifier of one live client connection.
pub type ConnectionId = Uuid;

// ============================================================================
// Topics
// ============================================================================

/// Logical pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `request:{requestId}`
    Request(Uuid),
    /// `queue:{spaceId}`
    Queue(Uuid),
    /// `user:{loginId}`
    User(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Request(id) => write!(f, "request:{id}"),
            Topic::Queue(id) => write!(f, "queue:{id}"),
            Topic::User(login) => write!(f, "user:{login}"),
        }
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidInput(format!("malformed topic: {s}")))?;
        let parse_id = |raw: &str| {
            Uuid::parse_str(raw).map_err(|_| Error::InvalidInput(format!("malformed topic: {s}")))
        };
        match kind {
            "request" => Ok(Topic::Request(parse_id(rest)?)),
            "queue" => Ok(Topic::Queue(parse_id(rest)?)),
            "user" if !rest.is_empty() => Ok(Topic::User(rest.to_string())),
            _ => Err(Error::InvalidInput(format!("malformed topic: {s}"))),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Position/status change for space-scoped listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub request_id: Uuid,
    pub space_id: Uuid,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

/// Intermediate progress of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestProgress {
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Successful completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestComplete {
    pub request_id: Uuid,
    pub space_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub result: JsonValue,
}

/// Failed attempt. `will_retry` tells a provisional failure (the queue
/// will run the job again) from the final one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFailed {
    pub request_id: Uuid,
    pub space_id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub error: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub will_retry: bool,
}

/// Mid-processing clarification prompt. The processor enforces the timeout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAskUser {
    pub request_id: Uuid,
    pub question_id: Uuid,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub timeout_ms: u64,
}

/// Server-pushed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    #[serde(rename = "queue:update")]
    QueueUpdate(QueueUpdate),
    #[serde(rename = "request:progress")]
    RequestProgress(RequestProgress),
    #[serde(rename = "request:complete")]
    RequestComplete(RequestComplete),
    #[serde(rename = "request:failed")]
    RequestFailed(RequestFailed),
    #[serde(rename = "request:ask_user")]
    RequestAskUser(RequestAskUser),
}

impl HubEvent {
    /// Wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::QueueUpdate(_) => "queue:update",
            HubEvent::RequestProgress(_) => "request:progress",
            HubEvent::RequestComplete(_) => "request:complete",
            HubEvent::RequestFailed(_) => "request:failed",
            HubEvent::RequestAskUser(_) => "request:ask_user",
        }
    }

    /// Request this event relates to.
    pub fn request_id(&self) -> Uuid {
        match self {
            HubEvent::QueueUpdate(e) => e.request_id,
            HubEvent::RequestProgress(e) => e.request_id,
            HubEvent::RequestComplete(e) => e.request_id,
            HubEvent::RequestFailed(e) => e.request_id,
            HubEvent::RequestAskUser(e) => e.request_id,
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

struct ConnectionEntry {
    tx: mpsc::Sender<HubEvent>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<Topic, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl HubState {
    fn remove_member(&mut self, topic: &Topic, conn: ConnectionId) {
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(&conn);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// Topic-room pub/sub over per-connection channels.
pub struct NotificationHub {
    capacity: usize,
    state: RwLock<HubState>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(crate::defaults::HUB_CHANNEL_CAPACITY)
    }
}

impl NotificationHub {
    /// Create a hub whose connections buffer up to `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(HubState::default()),
        }
    }

    /// Register an authenticated connection and join it to its user topic.
    pub async fn connect(&self, login: &str) -> (ConnectionId, mpsc::Receiver<HubEvent>) {
        let (conn, rx) = self.connect_anonymous().await;
        self.join(conn, Topic::User(login.to_string())).await;
        (conn, rx)
    }

    /// Register a connection with no topics.
    pub async fn connect_anonymous(&self) -> (ConnectionId, mpsc::Receiver<HubEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let conn = Uuid::new_v4();
        let mut state = self.state.write().await;
        state.connections.insert(
            conn,
            ConnectionEntry {
                tx,
                topics: HashSet::new(),
            },
        );
        tracing::debug!(subsystem = "hub", connection_id = %conn, "Connection registered");
        (conn, rx)
    }

    /// Add a connection to a topic. Returns `false` for unknown connections.
    pub async fn join(&self, conn: ConnectionId, topic: Topic) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.get_mut(&conn) else {
            return false;
        };
        entry.topics.insert(topic.clone());
        tracing::debug!(subsystem = "hub", connection_id = %conn, topic = %topic, "Joined topic");
        state.topics.entry(topic).or_default().insert(conn);
        true
    }

    /// Remove a connection from a topic. Returns `false` if it was not a
    /// member.
    pub async fn leave(&self, conn: ConnectionId, topic: &Topic) -> bool {
        let mut state = self.state.write().await;
        let was_member = match state.connections.get_mut(&conn) {
            Some(entry) => entry.topics.remove(topic),
            None => false,
        };
        if was_member {
            state.remove_member(topic, conn);
            tracing::debug!(subsystem = "hub", connection_id = %conn, topic = %topic, "Left topic");
        }
        was_member
    }

    /// Drop a connection and all of its memberships.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.connections.remove(&conn) {
            for topic in &entry.topics {
                state.remove_member(topic, conn);
            }
            tracing::debug!(
                subsystem = "hub",
                connection_id = %conn,
                topics = entry.topics.len(),
                "Connection removed"
            );
        }
    }

    /// Deliver an event to every member of `topic`. Returns the number of
    /// connections that accepted it.
    pub async fn emit(&self, topic: &Topic, event: HubEvent) -> usize {
        self.emit_many(std::slice::from_ref(topic), event).await
    }

    /// Deliver an event to the union of several topics. A connection that is
    /// a member of more than one of them receives the event once.
    pub async fn emit_many(&self, topics: &[Topic], event: HubEvent) -> usize {
        let state = self.state.read().await;
        let mut targets: HashSet<ConnectionId> = HashSet::new();
        for topic in topics {
            if let Some(members) = state.topics.get(topic) {
                targets.extend(members.iter().copied());
            }
        }

        let mut delivered = 0;
        for conn in targets {
            let Some(entry) = state.connections.get(&conn) else {
                continue;
            };
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        subsystem = "hub",
                        connection_id = %conn,
                        event = event.name(),
                        "Connection buffer full, event dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(
                        subsystem = "hub",
                        connection_id = %conn,
                        "Connection closed before disconnect"
                    );
                }
            }
        }

        tracing::debug!(
            subsystem = "hub",
            event = event.name(),
            request_id = %event.request_id(),
            topics = topics.len(),
            delivered,
            "Hub emit"
        );
        delivered
    }

    /// Connections currently joined to `topic`.
    pub async fn members(&self, topic: &Topic) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topics a connection has joined.
    pub async fn topics_of(&self, conn: ConnectionId) -> Vec<Topic> {
        let state = self.state.read().await;
        state
            .connections
            .get(&conn)
            .map(|e| e.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
