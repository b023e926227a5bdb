//! Core functionality for the order gateway

pub mod broadcast;
pub mod connection;
pub mod destination;
pub mod frame;
pub mod handler;
pub mod router;
pub mod server;
pub mod subscription;

// Re-export main components for convenience
pub use broadcast::{BroadcastStats, Broadcaster};
pub use connection::{
    CloseReason, Connection, ConnectionManager, ConnectionState, LifecycleEvent, TransportKind,
};
pub use destination::{DestinationClassifier, DestinationKind, DestinationPattern};
pub use frame::{Command, Frame, HeartBeat, Incoming};
pub use handler::{order_handlers, FnHandler, HandlerContext, HandlerTable, IdentityHandler, MessageHandler};
pub use router::{DestinationRouter, Outbound};
pub use server::{FrameOutcome, GatewayServer, SharedGatewayServer};
pub use subscription::{Subscriber, Subscription, SubscriptionRegistry};
