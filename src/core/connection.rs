//! Connection management
//! Handles identity, state and outbound buffering of client connections

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::core::frame::HEARTBEAT;
use crate::error::{GatewayError, Result};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 1024;

/// Missed heart-beats tolerated before a connection counts as stale
const HEARTBEAT_GRACE_FACTOR: u32 = 2;

/// Lifecycle of a connection; CLOSED is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Transport a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    XhrPolling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::XhrPolling => f.write_str("xhr-polling"),
        }
    }
}

/// Why a connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client sent DISCONNECT or closed the transport cleanly
    ClientDisconnect,
    /// The transport failed underneath the connection
    TransportError,
    /// The client sent a malformed or out-of-order frame
    ProtocolError,
    /// Nothing was received within the liveness timeout
    HeartbeatTimeout,
}

/// Events published on the lifecycle stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Opened {
        connection_id: String,
        transport: TransportKind,
    },
    Closed {
        connection_id: String,
        reason: CloseReason,
    },
}

/// State of a single client connection
pub struct Connection {
    pub id: String,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
    sender: Mutex<Option<mpsc::Sender<String>>>,
    state: AtomicU8,
    last_seen: Mutex<Instant>,
    outgoing_heartbeat_ms: AtomicU64,
    incoming_heartbeat_ms: AtomicU64,
    session_established: AtomicBool,
    closed: Notify,
}

impl Connection {
    /// Create a new connection with a unique ID, in the CONNECTING state
    pub fn new(sender: mpsc::Sender<String>, transport: TransportKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            connected_at: Utc::now(),
            sender: Mutex::new(Some(sender)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_seen: Mutex::new(Instant::now()),
            outgoing_heartbeat_ms: AtomicU64::new(0),
            incoming_heartbeat_ms: AtomicU64::new(0),
            session_established: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move from `from` to `to`; false if the connection was not in `from`
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Queue a text frame for the client; fails unless the connection is OPEN
    pub fn send_text(&self, text: &str) -> bool {
        if !self.is_open() {
            debug!("Dropping frame for connection {} in state {:?}", self.id, self.state());
            return false;
        }
        self.enqueue(text.to_string())
    }

    fn enqueue(&self, text: String) -> bool {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Sender lock poisoned for connection {}: {}", self.id, e);
                return false;
            }
        };
        match guard.as_ref() {
            Some(sender) => match sender.try_send(text) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Outbound buffer full for connection {}", self.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Outbound channel closed for connection {}", self.id);
                    false
                }
            },
            None => false,
        }
    }

    /// Record inbound activity
    pub fn touch(&self) -> Result<()> {
        *self.last_seen.lock()? = Instant::now();
        Ok(())
    }

    /// Time since the last inbound activity
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|seen| seen.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// How long the connection may stay silent before it is stale; `None` means never.
    ///
    /// Before CONNECT the plain timeout applies. Afterwards a negotiated client
    /// heart-beat widens it to a few missed beats. Without one, WebSocket peers
    /// are trusted until their transport closes, while polling sessions still
    /// need to poll within the timeout.
    pub fn liveness_window(&self, timeout: Duration) -> Option<Duration> {
        if !self.session_established() {
            return Some(timeout);
        }
        match (self.incoming_heartbeat(), self.transport) {
            (Some(interval), _) => Some(timeout.max(interval * HEARTBEAT_GRACE_FACTOR)),
            (None, TransportKind::XhrPolling) => Some(timeout),
            (None, TransportKind::WebSocket) => None,
        }
    }

    /// Check if the connection is stale (silent longer than its liveness window)
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.liveness_window(timeout)
            .map_or(false, |window| self.idle_for() > window)
    }

    pub fn set_outgoing_heartbeat(&self, interval: Option<Duration>) {
        let millis = interval.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.outgoing_heartbeat_ms.store(millis, Ordering::Release);
    }

    pub fn outgoing_heartbeat(&self) -> Option<Duration> {
        match self.outgoing_heartbeat_ms.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Interval at which the client promised to send heart-beats
    pub fn set_incoming_heartbeat(&self, interval: Option<Duration>) {
        let millis = interval.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.incoming_heartbeat_ms.store(millis, Ordering::Release);
    }

    pub fn incoming_heartbeat(&self) -> Option<Duration> {
        match self.incoming_heartbeat_ms.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Mark the STOMP session as established; false if it already was
    pub fn establish_session(&self) -> bool {
        !self.session_established.swap(true, Ordering::AcqRel)
    }

    pub fn session_established(&self) -> bool {
        self.session_established.load(Ordering::Acquire)
    }

    /// Resolves once the connection reaches CLOSED
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        (Utc::now() - self.connected_at).to_std().unwrap_or_default()
    }
}

/// Owns every live connection and publishes their lifecycle events
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    events: broadcast::Sender<LifecycleEvent>,
    max_connections: usize,
    buffer_size: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
            max_connections,
            buffer_size,
        }
    }

    /// Observe connection lifecycle events
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Accept a completed transport handshake: allocate an id and open the connection.
    /// Returns the connection and the receiving end of its outbound buffer.
    pub async fn open(
        &self,
        transport: TransportKind,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<String>)> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let connection = Arc::new(Connection::new(tx, transport));

        {
            let mut connections = self.connections.write().await;
            if connections.len() >= self.max_connections {
                return Err(GatewayError::ConnectionLimit(self.max_connections));
            }
            connections.insert(connection.id.clone(), Arc::clone(&connection));
            connection.transition(ConnectionState::Connecting, ConnectionState::Open);
        }

        info!("Connection opened: {} via {}", connection.id, transport);
        let _ = self.events.send(LifecycleEvent::Opened {
            connection_id: connection.id.clone(),
            transport,
        });

        Ok((connection, rx))
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Resolve several connections under one read lock
    pub async fn get_many(&self, connection_ids: &[&str]) -> Vec<Option<Arc<Connection>>> {
        let connections = self.connections.read().await;
        connection_ids
            .iter()
            .map(|id| connections.get(*id).cloned())
            .collect()
    }

    /// Send a text frame to one connection; false if it is unknown or not OPEN
    pub async fn send(&self, connection_id: &str, text: &str) -> bool {
        match self.get(connection_id).await {
            Some(connection) => connection.send_text(text),
            None => false,
        }
    }

    pub async fn is_open(&self, connection_id: &str) -> bool {
        self.get(connection_id)
            .await
            .map(|connection| connection.is_open())
            .unwrap_or(false)
    }

    /// OPEN -> CLOSING. Returns the connection only to the caller that performed the transition.
    pub async fn begin_close(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let connection = self.get(connection_id).await?;
        connection
            .transition(ConnectionState::Open, ConnectionState::Closing)
            .then_some(connection)
    }

    /// CLOSING -> CLOSED: forget the connection, drop its outbound buffer and wake waiters
    pub async fn finish_close(&self, connection: &Connection, reason: CloseReason) {
        self.connections.write().await.remove(&connection.id);

        if let Ok(mut sender) = connection.sender.lock() {
            sender.take();
        }
        connection.state.store(ConnectionState::Closed as u8, Ordering::Release);
        connection.closed.notify_waiters();

        info!(
            "Connection closed: {} ({:?}) after {}s",
            connection.id,
            reason,
            connection.connection_duration().as_secs()
        );
        let _ = self.events.send(LifecycleEvent::Closed {
            connection_id: connection.id.clone(),
            reason,
        });
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Check for stale connections and return their IDs
    pub async fn stale_connections(&self, timeout: Duration) -> Vec<String> {
        self.connections
            .read()
            .await
            .iter()
            .filter(|(_, connection)| connection.is_open() && connection.is_stale(timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Send a heart-beat to every open connection that negotiated one
    pub async fn send_heartbeats(&self) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|connection| connection.is_open() && connection.outgoing_heartbeat().is_some())
            .filter(|connection| connection.enqueue(HEARTBEAT.to_string()))
            .count()
    }
}
