use std::error::Error;
use std::fmt;
use std::sync::PoisonError;
use std::time::Duration;

#[derive(Debug)]
pub enum GatewayError {
    // Connection errors
    ConnectionNotFound(String),
    ConnectionClosed,
    ConnectionLimit(usize),
    HeartbeatTimeout(String),

    // Frame errors
    FrameParse(String),
    FrameTooLarge(usize),
    Protocol(String),

    // Routing errors
    Unroutable(String),
    InvalidDestination(String),
    DuplicateSubscription(String),

    // Handler errors
    Handler(String),
    HandlerTimeout(Duration),
    Registration(String),

    // System errors
    SystemError(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            Self::ConnectionClosed => write!(f, "Connection closed unexpectedly"),
            Self::ConnectionLimit(max) => write!(f, "Connection limit reached ({})", max),
            Self::HeartbeatTimeout(id) => write!(f, "Heartbeat timeout on connection {}", id),
            Self::FrameParse(msg) => write!(f, "Frame parse error: {}", msg),
            Self::FrameTooLarge(size) => write!(f, "Frame too large: {} bytes", size),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Unroutable(dest) => write!(f, "No route for destination: {}", dest),
            Self::InvalidDestination(dest) => write!(f, "Invalid destination: {}", dest),
            Self::DuplicateSubscription(msg) => write!(f, "Duplicate subscription: {}", msg),
            Self::Handler(msg) => write!(f, "Handler error: {}", msg),
            Self::HandlerTimeout(limit) => {
                write!(f, "Handler timed out after {} ms", limit.as_millis())
            }
            Self::Registration(msg) => write!(f, "Handler registration error: {}", msg),
            Self::SystemError(msg) => write!(f, "System error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for GatewayError {}

impl GatewayError {
    /// Errors after which the connection that produced them must be torn down
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::HeartbeatTimeout(_)
                | Self::FrameParse(_)
                | Self::FrameTooLarge(_)
                | Self::Protocol(_)
        )
    }
}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for GatewayError {
    fn from(err: PoisonError<T>) -> Self {
        GatewayError::SystemError(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_fatal_classification() {
        assert!(GatewayError::FrameParse("bad".into()).is_transport_fatal());
        assert!(GatewayError::HeartbeatTimeout("c1".into()).is_transport_fatal());
        assert!(!GatewayError::Handler("boom".into()).is_transport_fatal());
        assert!(!GatewayError::Unroutable("/nowhere".into()).is_transport_fatal());
    }

    #[test]
    fn test_display_mentions_timeout() {
        let err = GatewayError::HandlerTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "Handler timed out after 250 ms");
    }
}
