//! Gateway server context that coordinates connections, routing and subscriptions

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::GatewayConfig;
use crate::constants::STOMP_VERSION;
use crate::core::broadcast::{BroadcastStats, Broadcaster};
use crate::core::connection::{CloseReason, Connection, ConnectionManager, TransportKind};
use crate::core::destination::DestinationClassifier;
use crate::core::frame::{Command, Frame, HeartBeat, Incoming};
use crate::core::handler::HandlerTable;
use crate::core::router::DestinationRouter;
use crate::core::subscription::SubscriptionRegistry;
use crate::error::{GatewayError, Result};

const SUPPORTED_VERSIONS: [&str; 3] = ["1.2", "1.1", "1.0"];

/// What the transport should do after an inbound text was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close(CloseReason),
}

/// Server context shared by every transport handler
pub struct GatewayServer {
    config: GatewayConfig,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Broadcaster,
    router: DestinationRouter,
}

impl GatewayServer {
    /// Create the server context from a validated configuration and the handler bindings
    pub fn new(config: GatewayConfig, handlers: HandlerTable) -> Result<Self> {
        config.validate()?;

        let classifier = DestinationClassifier::new(&config.app_prefix, &config.broker_prefix);
        let router = DestinationRouter::new(classifier, handlers, config.handler_timeout)?;

        let connections = Arc::new(ConnectionManager::new(
            config.max_connections,
            config.buffer_size,
        ));
        let registry = Arc::new(SubscriptionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&connections), Arc::clone(&registry));

        Ok(Self {
            config,
            connections,
            registry,
            broadcaster,
            router,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &DestinationRouter {
        &self.router
    }

    /// Register a connection whose transport handshake has completed
    pub async fn connect(
        &self,
        transport: TransportKind,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<String>)> {
        let opened = self.connections.open(transport).await?;
        debug!("Current connections: {}", self.connections.count().await);
        Ok(opened)
    }

    /// Process one inbound text message from a connection, in arrival order
    pub async fn handle_text(&self, connection_id: &str, text: &str) -> FrameOutcome {
        let connection = match self.connections.get(connection_id).await {
            Some(connection) if connection.is_open() => connection,
            _ => return FrameOutcome::Close(CloseReason::TransportError),
        };

        if let Err(e) = connection.touch() {
            warn!("Failed to record activity for {}: {}", connection_id, e);
        }

        if text.len() > self.config.max_frame_size {
            return self.reject(&connection, GatewayError::FrameTooLarge(text.len()));
        }

        let frame = match Frame::parse(text) {
            Ok(Incoming::Heartbeat) => {
                debug!("Heart-beat from {}", connection_id);
                return FrameOutcome::Continue;
            }
            Ok(Incoming::Frame(frame)) => frame,
            Err(e) => return self.reject(&connection, e),
        };

        debug!("{} frame from {}", frame.command, connection_id);
        match self.handle_frame(&connection, &frame).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transport_fatal() => self.reject(&connection, e),
            Err(e) => {
                warn!("Ignoring {} frame from {}: {}", frame.command, connection_id, e);
                FrameOutcome::Continue
            }
        }
    }

    async fn handle_frame(&self, connection: &Connection, frame: &Frame) -> Result<FrameOutcome> {
        if frame.command.is_server_command() {
            return Err(GatewayError::Protocol(format!(
                "{} is a server frame",
                frame.command
            )));
        }

        match frame.command {
            Command::Connect | Command::Stomp => {
                self.accept_session(connection, frame)?;
                return Ok(FrameOutcome::Continue);
            }
            _ if !connection.session_established() => {
                return Err(GatewayError::Protocol(format!(
                    "Expected CONNECT, got {}",
                    frame.command
                )));
            }
            _ => {}
        }

        match frame.command {
            Command::Send => {
                let destination = required_header(frame, "destination")?;
                if self.dispatch(&connection.id, destination, &frame.body).await {
                    send_receipt(connection, frame);
                }
                Ok(FrameOutcome::Continue)
            }
            Command::Subscribe => {
                let destination = required_header(frame, "destination")?;
                let subscription_id = frame.header("id").unwrap_or(destination);
                self.subscribe(&connection.id, destination, subscription_id).await?;
                send_receipt(connection, frame);
                Ok(FrameOutcome::Continue)
            }
            Command::Unsubscribe => {
                let subscription_id = required_header(frame, "id")?;
                self.unsubscribe(&connection.id, subscription_id).await;
                send_receipt(connection, frame);
                Ok(FrameOutcome::Continue)
            }
            // Deliveries are fire-and-forget, so acknowledgements carry no meaning
            Command::Ack | Command::Nack => Ok(FrameOutcome::Continue),
            Command::Disconnect => {
                send_receipt(connection, frame);
                Ok(FrameOutcome::Close(CloseReason::ClientDisconnect))
            }
            _ => Err(GatewayError::Protocol(format!(
                "Unexpected {} frame",
                frame.command
            ))),
        }
    }

    /// Answer CONNECT/STOMP: negotiate version and heart-beats
    fn accept_session(&self, connection: &Connection, frame: &Frame) -> Result<()> {
        if !connection.establish_session() {
            return Err(GatewayError::Protocol("Session already established".to_string()));
        }

        let version = match frame.header("accept-version") {
            Some(accepted) => {
                let offered: Vec<&str> = accepted.split(',').map(str::trim).collect();
                SUPPORTED_VERSIONS
                    .iter()
                    .find(|&&version| offered.contains(&version))
                    .copied()
                    .ok_or_else(|| {
                        GatewayError::Protocol(format!(
                            "Supported protocol versions are {}",
                            SUPPORTED_VERSIONS.join(",")
                        ))
                    })?
            }
            None => "1.0",
        };

        let client_heart_beat = match frame.header("heart-beat") {
            Some(value) => HeartBeat::parse(value)?,
            None => HeartBeat::default(),
        };
        let heart_beat = HeartBeat::negotiate(client_heart_beat, self.config.ping_interval);
        connection.set_outgoing_heartbeat(heart_beat.outgoing_interval());
        connection.set_incoming_heartbeat(heart_beat.incoming_interval());

        let connected = Frame::connected(version, &connection.id, heart_beat);
        connection.send_text(&connected.encode());
        info!(
            "STOMP {} session on {} (heart-beat {})",
            version, connection.id, heart_beat
        );
        if version != STOMP_VERSION {
            debug!("Client {} negotiated an older protocol version", connection.id);
        }
        Ok(())
    }

    /// Route a SEND. Returns true if something was published.
    async fn dispatch(&self, connection_id: &str, destination: &str, payload: &str) -> bool {
        match self.router.route(connection_id, destination, payload).await {
            Ok(outbound) => {
                let stats = self.publish(&outbound.topic, &outbound.payload).await;
                info!(
                    "Broadcast from {} via {} to {} ({} of {} delivered)",
                    connection_id,
                    destination,
                    outbound.topic,
                    stats.delivered,
                    stats.recipients
                );
                true
            }
            Err(e @ GatewayError::Unroutable(_)) => {
                warn!("Discarding message from {}: {}", connection_id, e);
                false
            }
            Err(e) => {
                error!(
                    "Dropping message from {} to {}: {}",
                    connection_id, destination, e
                );
                false
            }
        }
    }

    /// Subscribe an open connection to a broker topic
    pub async fn subscribe(
        &self,
        connection_id: &str,
        destination: &str,
        subscription_id: &str,
    ) -> Result<bool> {
        let topic = self.router.subscription_topic(destination)?;
        let connection = self
            .connections
            .get(connection_id)
            .await
            .ok_or_else(|| GatewayError::ConnectionNotFound(connection_id.to_string()))?;

        let added = self
            .registry
            .subscribe_open(&connection, topic, subscription_id)
            .await?;

        if added {
            debug!("{} subscribed to {} as {}", connection_id, topic, subscription_id);
        }
        Ok(added)
    }

    /// Drop a subscription by its id; returns the topic it was on
    pub async fn unsubscribe(&self, connection_id: &str, subscription_id: &str) -> Option<String> {
        let topic = self
            .registry
            .unsubscribe_by_id(connection_id, subscription_id)
            .await;
        match &topic {
            Some(topic) => debug!("{} unsubscribed from {}", connection_id, topic),
            None => debug!("{} has no subscription {}", connection_id, subscription_id),
        }
        topic
    }

    /// Broadcast a payload to a topic's current subscribers
    pub async fn publish(&self, topic: &str, payload: &str) -> BroadcastStats {
        self.broadcaster.publish(topic, payload).await
    }

    /// Tear a connection down: CLOSING, drop its subscriptions, CLOSED.
    /// Returns false if the connection was already closing or unknown.
    pub async fn disconnect(&self, connection_id: &str, reason: CloseReason) -> bool {
        let connection = match self.connections.begin_close(connection_id).await {
            Some(connection) => connection,
            None => return false,
        };

        let removed = self.registry.on_connection_closed(connection_id).await;
        self.connections.finish_close(&connection, reason).await;

        debug!(
            "Removed {} subscriptions of {}; current connections: {}",
            removed,
            connection_id,
            self.connections.count().await
        );
        true
    }

    /// Send an ERROR frame for a fatal error and ask the transport to close
    fn reject(&self, connection: &Connection, err: GatewayError) -> FrameOutcome {
        warn!("Closing connection {}: {}", connection.id, err);
        let detail = err.to_string();
        let summary = match &err {
            GatewayError::FrameParse(_) | GatewayError::FrameTooLarge(_) => "malformed frame",
            _ => "protocol error",
        };
        connection.send_text(&Frame::error(summary, &detail).encode());
        FrameOutcome::Close(CloseReason::ProtocolError)
    }

    /// Start the periodic liveness sweep: closes idle connections and sends heart-beats
    pub fn start_liveness_task(self: Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = interval(server.config.ping_interval);
            loop {
                ticker.tick().await;
                server.sweep(server.config.connection_timeout).await;
            }
        })
    }

    /// One liveness cycle with bounded work
    pub async fn sweep(&self, timeout: Duration) -> usize {
        // Limit cleanup operations to keep one cycle short
        const MAX_CLEANUP_OPERATIONS_PER_CYCLE: usize = 50;

        let stale = self.connections.stale_connections(timeout).await;
        if stale.len() > MAX_CLEANUP_OPERATIONS_PER_CYCLE {
            warn!(
                "Large number of stale connections detected ({}), processing {} this cycle",
                stale.len(),
                MAX_CLEANUP_OPERATIONS_PER_CYCLE
            );
        }

        let mut cleaned = 0;
        for connection_id in stale.into_iter().take(MAX_CLEANUP_OPERATIONS_PER_CYCLE) {
            warn!("{}", GatewayError::HeartbeatTimeout(connection_id.clone()));
            if self.disconnect(&connection_id, CloseReason::HeartbeatTimeout).await {
                cleaned += 1;
            }
        }
        if cleaned > 0 {
            info!("Cleanup cycle completed: {} stale connections closed", cleaned);
        }

        let beats = self.connections.send_heartbeats().await;
        if beats > 0 {
            debug!("Sent {} heart-beats", beats);
        }

        cleaned
    }
}

fn required_header<'a>(frame: &'a Frame, name: &str) -> Result<&'a str> {
    frame.header(name).ok_or_else(|| {
        GatewayError::Protocol(format!("{} frame requires a '{}' header", frame.command, name))
    })
}

fn send_receipt(connection: &Connection, frame: &Frame) {
    if let Some(receipt) = frame.receipt() {
        connection.send_text(&Frame::receipt_for(receipt).encode());
    }
}

// Shared reference to the gateway server
pub type SharedGatewayServer = Arc<GatewayServer>;
