// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const WS_PATH: &str = "ws";

// Destination conventions
pub const DEFAULT_APP_PREFIX: &str = "/app";
pub const DEFAULT_BROKER_PREFIX: &str = "/topic";
pub const NEW_ORDER_DESTINATION: &str = "/new-order";
pub const ORDERS_TOPIC_NAME: &str = "orders";

// Connection and delivery tuning
pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

// Static front end
pub const DEFAULT_STATIC_DIR: &str = "static";
pub const DEFAULT_INDEX_FILE: &str = "index.html";

// STOMP protocol
pub const STOMP_VERSION: &str = "1.2";
pub const SERVER_NAME: &str = concat!("order-gateway/", env!("CARGO_PKG_VERSION"));
