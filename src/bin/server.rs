use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use order_gateway::config::GatewayConfig;
use order_gateway::core::handler::order_handlers;
use order_gateway::core::server::GatewayServer;
use order_gateway::handlers::routes;
use order_gateway::handlers::sockjs::PollingSessions;

#[tokio::main]
async fn main() {
    // Initialize env before logging so RUST_LOG can come from .env
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    // Load config from the environment
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: host={}, port={}, endpoint=/{}, app prefix={}, broker prefix={}",
        config.host, config.port, config.ws_path, config.app_prefix, config.broker_prefix
    );

    // Build the server address
    let addr: SocketAddr = match config.bind_address().parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let handlers = match order_handlers(&config) {
        Ok(handlers) => handlers,
        Err(e) => {
            error!("Failed to register handlers: {}", e);
            std::process::exit(1);
        }
    };
    for binding in handlers.describe() {
        info!(
            "Route {}{} -> {} ({})",
            config.app_prefix, binding.pattern, binding.topic, binding.description
        );
    }

    let server = match GatewayServer::new(config, handlers) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to create gateway: {}", e);
            std::process::exit(1);
        }
    };

    // Log connection lifecycle events
    let mut events = server.connections().lifecycle_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!("Lifecycle: {}", json),
                    Err(e) => warn!("Failed to serialize lifecycle event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => warn!("Lifecycle log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Start background tasks
    let _liveness = Arc::clone(&server).start_liveness_task();
    let polling = Arc::new(PollingSessions::new(Arc::clone(&server)));
    let _polling_cleanup = Arc::clone(&polling).start_cleanup_task();

    let routes = routes(server, polling);

    info!("Starting order gateway on {}", addr);

    let (bound, serving) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    });
    info!("Listening on {}", bound);
    serving.await;
    info!("Order gateway stopped");
}
