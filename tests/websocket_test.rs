// Integration test for the order gateway over a real TCP socket
// Validates the WebSocket handshake, STOMP exchange and the health endpoint

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use common::{parse_frame, send_frame, subscribe_frame, CONNECT, RECV_TIMEOUT};
use order_gateway::config::GatewayConfig;
use order_gateway::core::frame::{Command, Frame};
use order_gateway::core::handler::order_handlers;
use order_gateway::core::server::{GatewayServer, SharedGatewayServer};
use order_gateway::handlers::routes;
use order_gateway::handlers::sockjs::PollingSessions;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Start the gateway on an ephemeral port
fn start_server(config: GatewayConfig) -> (SocketAddr, SharedGatewayServer) {
    let handlers = order_handlers(&config).unwrap();
    let server = Arc::new(GatewayServer::new(config, handlers).unwrap());
    let polling = Arc::new(PollingSessions::new(Arc::clone(&server)));
    let filter = routes(Arc::clone(&server), polling);

    let (addr, serving) = warp::serve(filter).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(serving);
    (addr, server)
}

async fn connect(addr: SocketAddr) -> Client {
    let (mut client, response) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket server");
    assert_eq!(response.status(), 101);

    client.send(Message::Text(CONNECT.to_string())).await.unwrap();
    let connected = next_frame(&mut client).await;
    assert_eq!(connected.command, Command::Connected);
    assert_eq!(connected.header("version"), Some("1.2"));
    client
}

async fn next_frame(client: &mut Client) -> Frame {
    loop {
        let message = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("WebSocket error");
        match message {
            Message::Text(text) if text != "\n" => return parse_frame(&text),
            Message::Text(_) | Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_websocket_order_exchange() {
    let (addr, server) = start_server(GatewayConfig::for_testing());

    let mut kitchen = connect(addr).await;
    let mut till = connect(addr).await;

    kitchen
        .send(Message::Text(subscribe_frame("0", "/topic/orders")))
        .await
        .unwrap();
    let receipt = next_frame(&mut kitchen).await;
    assert_eq!(receipt.command, Command::Receipt);

    till.send(Message::Text(send_frame("/app/new-order", "Table 5: Pizza")))
        .await
        .unwrap();

    let message = next_frame(&mut kitchen).await;
    assert_eq!(message.command, Command::Message);
    assert_eq!(message.destination(), Some("/topic/orders"));
    assert_eq!(message.body, "Table 5: Pizza");

    // Dropping the socket tears the connection down
    kitchen.close(None).await.unwrap();
    drop(kitchen);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connections().count().await, 1);
    assert!(server.registry().subscribers_of("/topic/orders").await.is_empty());
}

#[tokio::test]
async fn test_heartbeats_are_sent_when_negotiated() {
    let (addr, server) = start_server(GatewayConfig::for_testing());
    let _liveness = Arc::clone(&server).start_liveness_task();

    let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
        .send(Message::Text(
            "CONNECT\naccept-version:1.2\nheart-beat:0,1000\n\n\0".to_string(),
        ))
        .await
        .unwrap();
    let connected = next_frame(&mut client).await;
    assert_eq!(connected.header("heart-beat"), Some("1000,0"));

    let beat = timeout(Duration::from_secs(3), client.next())
        .await
        .expect("no heart-beat")
        .unwrap()
        .unwrap();
    assert_eq!(beat, Message::Text("\n".to_string()));
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _server) = start_server(GatewayConfig::for_testing());

    let response = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("health request");
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");

    let info: serde_json::Value = reqwest::get(format!("http://{}/ws/info", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["websocket"], true);
}
