//! XHR-polling fallback for clients that cannot open a WebSocket
//!
//! Implements the subset of the SockJS protocol used by browser STOMP clients:
//! `info`, `xhr` (long-poll) and `xhr_send`. Each SockJS session owns one
//! gateway connection. Frames posted to `xhr_send` go through a bounded
//! per-session queue drained by a single task, so they are processed in the
//! order sent. A full queue answers 503 and the client may retry.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::timeout;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::core::connection::{CloseReason, Connection, LifecycleEvent, TransportKind};
use crate::core::server::{FrameOutcome, SharedGatewayServer};

const OPEN_FRAME: &str = "o\n";
const HEARTBEAT_FRAME: &str = "h\n";
const GO_AWAY_FRAME: &str = "c[3000,\"Go away!\"]\n";
const POLL_IN_PROGRESS_FRAME: &str = "c[2010,\"Another connection still open\"]\n";
const CONTENT_TYPE: &str = "application/javascript;charset=UTF-8";

/// Body of the `info` response
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub websocket: bool,
    pub origins: Vec<&'static str>,
    pub cookie_needed: bool,
    pub entropy: u32,
}

/// One fallback session and the gateway connection behind it
pub struct PollingSession {
    connection: Arc<Connection>,
    inbound: mpsc::Sender<String>,
    outbound: Mutex<mpsc::Receiver<String>>,
}

impl PollingSession {
    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }
}

/// Fallback sessions keyed by their client-chosen SockJS session id
pub struct PollingSessions {
    server: SharedGatewayServer,
    sessions: RwLock<HashMap<String, Arc<PollingSession>>>,
}

impl PollingSessions {
    pub fn new(server: SharedGatewayServer) -> Self {
        Self {
            server,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn info(&self) -> InfoResponse {
        InfoResponse {
            websocket: true,
            origins: vec!["*:*"],
            cookie_needed: false,
            entropy: rand::random(),
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Long-poll for frames. The first poll of an unknown session opens it.
    pub async fn poll(&self, session_id: &str) -> Response {
        let existing = self.sessions.read().await.get(session_id).cloned();
        let session = match existing {
            Some(session) => session,
            None => return self.open(session_id).await,
        };

        if let Err(e) = session.connection.touch() {
            debug!("Failed to record poll for {}: {}", session_id, e);
        }

        // Only one poll may wait on a session at a time
        let mut outbound = match session.outbound.try_lock() {
            Ok(outbound) => outbound,
            Err(_) => return javascript(POLL_IN_PROGRESS_FRAME.to_string()),
        };

        let polled = timeout(self.server.config().poll_timeout, outbound.recv()).await;
        match polled {
            Ok(Some(first)) => {
                let mut frames = vec![first];
                while let Ok(next) = outbound.try_recv() {
                    frames.push(next);
                }
                match serde_json::to_string(&frames) {
                    Ok(array) => javascript(format!("a{}\n", array)),
                    Err(e) => {
                        warn!("Failed to encode frames for session {}: {}", session_id, e);
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    }
                }
            }
            Ok(None) => {
                drop(outbound);
                self.sessions.write().await.remove(session_id);
                debug!("Polling session {} is closed", session_id);
                javascript(GO_AWAY_FRAME.to_string())
            }
            Err(_) => javascript(HEARTBEAT_FRAME.to_string()),
        }
    }

    async fn open(&self, session_id: &str) -> Response {
        let (connection, outbound) = match self.server.connect(TransportKind::XhrPolling).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Rejecting polling session {}: {}", session_id, e);
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        };

        let (inbound, mut inbound_rx) = mpsc::channel::<String>(self.server.config().buffer_size);
        let session = Arc::new(PollingSession {
            connection: Arc::clone(&connection),
            inbound,
            outbound: Mutex::new(outbound),
        });

        let previous = self
            .sessions
            .write()
            .await
            .insert(session_id.to_string(), session);
        if let Some(previous) = previous {
            // Lost a race with a concurrent first poll; keep the newer session
            self.server
                .disconnect(previous.connection_id(), CloseReason::TransportError)
                .await;
        }

        // Process posted frames in order on a single task
        let server = Arc::clone(&self.server);
        let connection_id = connection.id.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound_rx.recv().await {
                if let FrameOutcome::Close(reason) = server.handle_text(&connection_id, &text).await
                {
                    server.disconnect(&connection_id, reason).await;
                    break;
                }
            }
            debug!("Inbound queue of {} finished", connection_id);
        });

        info!("Polling session {} opened as {}", session_id, connection.id);
        javascript(OPEN_FRAME.to_string())
    }

    /// Queue the frames posted by the client
    pub async fn send(&self, session_id: &str, body: &[u8]) -> StatusCode {
        let session = match self.sessions.read().await.get(session_id).cloned() {
            Some(session) => session,
            None => return StatusCode::NOT_FOUND,
        };

        let frames: Vec<String> = match serde_json::from_slice(body) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Invalid xhr_send payload for session {}: {}", session_id, e);
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        };

        if frames.is_empty() {
            return StatusCode::NO_CONTENT;
        }

        // A batch is queued whole or not at all
        let permits = match session.inbound.try_reserve_many(frames.len()) {
            Ok(permits) => permits,
            Err(mpsc::error::TrySendError::Full(())) => {
                warn!(
                    "Inbound queue of session {} is full, rejecting {} frames",
                    session_id,
                    frames.len()
                );
                return StatusCode::SERVICE_UNAVAILABLE;
            }
            Err(mpsc::error::TrySendError::Closed(())) => return StatusCode::NOT_FOUND,
        };
        for (permit, frame) in permits.zip(frames) {
            permit.send(frame);
        }
        StatusCode::NO_CONTENT
    }

    /// Forget the session backed by a closed connection
    pub async fn on_connection_closed(&self, connection_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.connection_id() != connection_id);
        sessions.len() != before
    }

    /// Follow connection lifecycle events and drop sessions whose connection closed.
    /// A closed session lingers for one poll timeout so a waiting poll can drain it.
    pub fn start_cleanup_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.server.connections().lifecycle_events();
        let linger = self.server.config().poll_timeout;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::Closed { connection_id, .. }) => {
                        let sessions = Arc::clone(&self);
                        tokio::spawn(async move {
                            tokio::time::sleep(linger).await;
                            if sessions.on_connection_closed(&connection_id).await {
                                debug!("Removed polling session for {}", connection_id);
                            }
                        });
                    }
                    Ok(LifecycleEvent::Opened { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Polling session cleanup missed {} lifecycle events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn javascript(body: String) -> Response {
    warp::reply::with_header(body, "content-type", CONTENT_TYPE).into_response()
}

fn with_sessions(
    sessions: Arc<PollingSessions>,
) -> impl Filter<Extract = (Arc<PollingSessions>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&sessions))
}

async fn info_handler(sessions: Arc<PollingSessions>) -> Result<Response, Infallible> {
    Ok(warp::reply::json(&sessions.info()).into_response())
}

async fn xhr_handler(
    _server_id: String,
    session_id: String,
    sessions: Arc<PollingSessions>,
) -> Result<Response, Infallible> {
    Ok(sessions.poll(&session_id).await)
}

async fn xhr_send_handler(
    _server_id: String,
    session_id: String,
    body: Bytes,
    sessions: Arc<PollingSessions>,
) -> Result<Response, Infallible> {
    let status = sessions.send(&session_id, &body).await;
    Ok(warp::reply::with_status(warp::reply(), status).into_response())
}

/// `GET /{ws_path}/info`, `POST /{ws_path}/{server}/{session}/xhr` and `.../xhr_send`
pub fn routes(
    sessions: Arc<PollingSessions>,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let config = sessions.server.config();
    let ws_path = config.ws_path.clone();
    // JSON string escaping inflates frames
    let body_limit = config.max_frame_size as u64 * 4;

    let info = warp::path(ws_path.clone())
        .and(warp::path("info"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_sessions(Arc::clone(&sessions)))
        .and_then(info_handler);

    let xhr = warp::path(ws_path.clone())
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path("xhr"))
        .and(warp::path::end())
        .and(warp::post())
        .and(with_sessions(Arc::clone(&sessions)))
        .and_then(xhr_handler);

    let xhr_send = warp::path(ws_path)
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path("xhr_send"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(body_limit))
        .and(warp::body::bytes())
        .and(with_sessions(sessions))
        .and_then(xhr_send_handler);

    info.or(xhr).unify().or(xhr_send).unify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::core::handler::order_handlers;
    use crate::core::server::GatewayServer;

    fn sessions() -> Arc<PollingSessions> {
        let config = GatewayConfig::for_testing();
        let handlers = order_handlers(&config).unwrap();
        let server = Arc::new(GatewayServer::new(config, handlers).unwrap());
        Arc::new(PollingSessions::new(server))
    }

    async fn post(
        filter: &(impl Filter<Extract = (Response,), Error = Rejection> + Clone + 'static),
        path: &str,
        body: &str,
    ) -> (StatusCode, String) {
        let response = warp::test::request()
            .method("POST")
            .path(path)
            .body(body.to_string())
            .reply(filter)
            .await;
        (
            response.status(),
            String::from_utf8_lossy(response.body()).to_string(),
        )
    }

    #[tokio::test]
    async fn test_info() {
        let filter = routes(sessions());
        let response = warp::test::request()
            .method("GET")
            .path("/ws/info")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let info: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(info["websocket"], true);
        assert_eq!(info["cookie_needed"], false);
        assert!(info["entropy"].is_u64());
    }

    #[tokio::test]
    async fn test_open_send_and_poll() {
        let sessions = sessions();
        let filter = routes(Arc::clone(&sessions));

        assert_eq!(post(&filter, "/ws/000/abc/xhr", "").await, (StatusCode::OK, "o\n".to_string()));
        assert_eq!(sessions.count().await, 1);

        let connect = serde_json::to_string(&["CONNECT\naccept-version:1.2\n\n\0"]).unwrap();
        let (status, _) = post(&filter, "/ws/000/abc/xhr_send", &connect).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = post(&filter, "/ws/000/abc/xhr", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("a[\"CONNECTED\\n"));
        assert!(body.ends_with("]\n"));
    }

    #[tokio::test]
    async fn test_idle_poll_returns_heartbeat() {
        let filter = routes(sessions());
        post(&filter, "/ws/000/idle/xhr", "").await;
        let (_, body) = post(&filter, "/ws/000/idle/xhr", "").await;
        assert_eq!(body, "h\n");
    }

    #[tokio::test]
    async fn test_send_errors() {
        let filter = routes(sessions());
        let (status, _) = post(&filter, "/ws/000/missing/xhr_send", "[]").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        post(&filter, "/ws/000/s1/xhr", "").await;
        let (status, _) = post(&filter, "/ws/000/s1/xhr_send", "not json").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_send_rejects_batch_larger_than_queue() {
        let mut config = GatewayConfig::for_testing();
        config.buffer_size = 2;
        let handlers = order_handlers(&config).unwrap();
        let server = Arc::new(GatewayServer::new(config, handlers).unwrap());
        let sessions = Arc::new(PollingSessions::new(server));
        let filter = routes(Arc::clone(&sessions));
        post(&filter, "/ws/000/busy/xhr", "").await;

        let flood = serde_json::to_string(&[
            "CONNECT\naccept-version:1.2\n\n\0",
            "SEND\ndestination:/app/new-order\n\nTable 1: Soup\0",
            "SEND\ndestination:/app/new-order\n\nTable 2: Bread\0",
        ])
        .unwrap();
        let (status, _) = post(&filter, "/ws/000/busy/xhr_send", &flood).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        // Nothing from the rejected batch was queued
        let (_, body) = post(&filter, "/ws/000/busy/xhr", "").await;
        assert_eq!(body, "h\n");

        let connect = serde_json::to_string(&["CONNECT\naccept-version:1.2\n\n\0"]).unwrap();
        let (status, _) = post(&filter, "/ws/000/busy/xhr_send", &connect).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = post(&filter, "/ws/000/busy/xhr", "").await;
        assert!(body.starts_with("a[\"CONNECTED\\n"));
    }

    #[tokio::test]
    async fn test_closed_connection_ends_session() {
        let sessions = sessions();
        let cleanup = Arc::clone(&sessions).start_cleanup_task();
        let filter = routes(Arc::clone(&sessions));
        post(&filter, "/ws/000/bye/xhr", "").await;

        let disconnect = serde_json::to_string(&[
            "CONNECT\naccept-version:1.2\n\n\0",
            "DISCONNECT\nreceipt:77\n\n\0",
        ])
        .unwrap();
        post(&filter, "/ws/000/bye/xhr_send", &disconnect).await;

        let mut polled = String::new();
        for _ in 0..10 {
            let (_, body) = post(&filter, "/ws/000/bye/xhr", "").await;
            polled.push_str(&body);
            if body.starts_with('c') {
                break;
            }
        }
        assert!(polled.contains("RECEIPT"));
        assert!(polled.ends_with("c[3000,\"Go away!\"]\n"));
        assert_eq!(sessions.count().await, 0);
        cleanup.abort();
    }
}
