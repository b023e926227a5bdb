//! Order Gateway - a real-time order relay for point-of-sale front ends
//!
//! Clients connect over WebSocket (or an XHR-polling fallback), speak STOMP
//! frames, send orders to application destinations and receive them again on
//! broker topics they subscribed to.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;

// Re-export main components
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
