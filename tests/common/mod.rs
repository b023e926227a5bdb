// Shared helpers for the gateway integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use warp::test::WsClient;
use warp::{Filter, Rejection, Reply};

use order_gateway::config::GatewayConfig;
use order_gateway::core::frame::{Command, Frame, Incoming};
use order_gateway::core::handler::HandlerTable;
use order_gateway::core::server::{GatewayServer, SharedGatewayServer};
use order_gateway::handlers::routes;
use order_gateway::handlers::sockjs::PollingSessions;

pub const CONNECT: &str = "CONNECT\naccept-version:1.2\nheart-beat:0,0\n\n\0";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub fn gateway(
    config: GatewayConfig,
    handlers: HandlerTable,
) -> (
    SharedGatewayServer,
    impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static,
) {
    let server = Arc::new(GatewayServer::new(config, handlers).expect("valid gateway"));
    let polling = Arc::new(PollingSessions::new(Arc::clone(&server)));
    let filter = routes(Arc::clone(&server), polling);
    (server, filter)
}

pub fn subscribe_frame(id: &str, destination: &str) -> String {
    format!(
        "SUBSCRIBE\nid:{}\ndestination:{}\nreceipt:sub-{}\n\n\0",
        id, destination, id
    )
}

pub fn send_frame(destination: &str, body: &str) -> String {
    format!(
        "SEND\ndestination:{}\ncontent-length:{}\n\n{}\0",
        destination,
        body.len(),
        body
    )
}

pub fn parse_frame(text: &str) -> Frame {
    match Frame::parse(text).expect("well-formed frame") {
        Incoming::Frame(frame) => frame,
        Incoming::Heartbeat => panic!("unexpected heart-beat"),
    }
}

/// Open a WebSocket and complete the STOMP handshake
pub async fn stomp_client<F>(filter: F) -> WsClient
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply + Send,
{
    let mut client = warp::test::ws()
        .path("/ws")
        .handshake(filter)
        .await
        .expect("handshake");
    client.send_text(CONNECT).await;
    let connected = next_frame(&mut client).await;
    assert_eq!(connected.command, Command::Connected);
    client
}

/// Subscribe and wait for the receipt so later publishes are seen
pub async fn subscribe(client: &mut WsClient, id: &str, destination: &str) {
    client.send_text(subscribe_frame(id, destination)).await;
    let receipt = next_frame(client).await;
    assert_eq!(receipt.command, Command::Receipt);
    assert_eq!(receipt.header("receipt-id"), Some(format!("sub-{}", id).as_str()));
}

pub async fn next_frame(client: &mut WsClient) -> Frame {
    let message = timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    parse_frame(message.to_str().expect("text message"))
}

/// True if nothing arrives within the quiet period
pub async fn stays_silent(client: &mut WsClient) -> bool {
    timeout(QUIET_PERIOD, client.recv()).await.is_err()
}

/// Wait until the server closes the socket
pub async fn expect_closed(client: &mut WsClient) {
    loop {
        match timeout(RECV_TIMEOUT, client.recv())
            .await
            .expect("socket was not closed")
        {
            Ok(message) if message.is_close() => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}
