use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use warp::ws::{Message, WebSocket};

use crate::core::connection::{CloseReason, TransportKind};
use crate::core::server::{FrameOutcome, SharedGatewayServer};

// Close code sent when the gateway is at capacity (RFC 6455 "try again later")
const TRY_AGAIN_LATER: u16 = 1013;

// Handle a WebSocket connection
pub async fn handle_ws_client(ws: WebSocket, server: SharedGatewayServer) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Register the connection
    let (connection, mut rx) = match server.connect(TransportKind::WebSocket).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Rejecting WebSocket connection: {}", e);
            let _ = ws_tx
                .send(Message::close_with(TRY_AGAIN_LATER, e.to_string()))
                .await;
            return;
        }
    };
    let connection_id = connection.id.clone();

    // Spawn a task to forward queued frames to the WebSocket.
    // It drains the buffer and ends once the connection drops its sender.
    let writer_id = connection_id.clone();
    let writer = tokio::task::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::text(text)).await {
                error!("Failed to send WebSocket message to {}: {}", writer_id, e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Handle incoming messages, one frame at a time
    let reason = loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(msg)) => {
                    if msg.is_close() {
                        break Some(CloseReason::ClientDisconnect);
                    }
                    if !(msg.is_text() || msg.is_binary()) {
                        // Ping/pong still proves the peer is alive
                        if let Err(e) = connection.touch() {
                            debug!("Failed to record activity for {}: {}", connection_id, e);
                        }
                        continue;
                    }

                    let text = match std::str::from_utf8(msg.as_bytes()) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Non UTF-8 message from {}: {}", connection_id, e);
                            break Some(CloseReason::ProtocolError);
                        }
                    };

                    match server.handle_text(&connection_id, text).await {
                        FrameOutcome::Continue => {}
                        FrameOutcome::Close(reason) => break Some(reason),
                    }
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", connection_id, e);
                    break Some(CloseReason::TransportError);
                }
                None => break Some(CloseReason::TransportError),
            },
            // Closed elsewhere, e.g. by the liveness sweep
            _ = connection.closed() => break None,
        }
    };

    if let Some(reason) = reason {
        server.disconnect(&connection_id, reason).await;
    }
    if let Err(e) = writer.await {
        error!("WebSocket writer for {} failed: {}", connection_id, e);
    }
    info!("WebSocket client disconnected: {}", connection_id);
}
