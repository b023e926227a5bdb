//! Request handlers for different server endpoints

pub mod sockjs;
pub mod spa;
pub mod websocket;

use std::convert::Infallible;
use std::sync::Arc;

use log::info;
use warp::{Filter, Rejection, Reply};

use crate::core::server::SharedGatewayServer;
use sockjs::PollingSessions;

// Re-export the websocket handler
pub use websocket::handle_ws_client;

// Helper function to include the server context in a request
pub fn with_server(
    server: SharedGatewayServer,
) -> impl Filter<Extract = (SharedGatewayServer,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&server))
}

/// All gateway routes: WebSocket endpoint, polling fallback, health, then the front end
pub fn routes(
    server: SharedGatewayServer,
    polling: Arc<PollingSessions>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let config = server.config();
    let ws_path = config.ws_path.clone();
    let static_dir = config.static_dir.clone();
    let index = config.index_path();

    // `/ws` and the raw-WebSocket alias `/ws/websocket`
    let ws_route = warp::path(ws_path)
        .and(warp::path("websocket").or(warp::any()).unify())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(Arc::clone(&server)))
        .map(|ws: warp::ws::Ws, server: SharedGatewayServer| {
            info!("New websocket connection");
            ws.on_upgrade(move |socket| handle_ws_client(socket, server))
        });

    // Create health check route
    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    ws_route
        .or(sockjs::routes(polling))
        .or(health_route)
        .or(spa::routes(static_dir, index))
}
