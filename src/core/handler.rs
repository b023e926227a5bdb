//! Application handlers
//!
//! A handler turns the payload sent to an application destination into the
//! payload broadcast on the topic bound alongside it. Bindings are registered
//! explicitly at startup, kept in registration order, and never change while
//! the gateway runs.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::constants::{NEW_ORDER_DESTINATION, ORDERS_TOPIC_NAME};
use crate::core::destination::DestinationPattern;
use crate::error::{GatewayError, Result};

/// Context passed to message handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub connection_id: String,
    /// Destination exactly as the client sent it
    pub destination: String,
    /// Destination with the application prefix stripped
    pub path: String,
}

/// Trait for application message handlers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Get the name of this handler (used in logs)
    fn name(&self) -> &'static str;

    /// Process a payload and return the payload to broadcast
    async fn handle(&self, payload: &str, context: &HandlerContext) -> Result<String>;

    /// Get handler metadata/description
    fn description(&self) -> &'static str {
        "Application message handler"
    }
}

/// Broadcasts the payload unchanged
pub struct IdentityHandler;

#[async_trait]
impl MessageHandler for IdentityHandler {
    fn name(&self) -> &'static str {
        "identity"
    }

    async fn handle(&self, payload: &str, _context: &HandlerContext) -> Result<String> {
        Ok(payload.to_string())
    }

    fn description(&self) -> &'static str {
        "Relays the payload unchanged"
    }
}

/// Adapts a plain function into a handler. Meant for cheap, non-blocking transformations.
pub struct FnHandler<F> {
    name: &'static str,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    pub fn new(name: &'static str, func: F) -> Self {
        Self { name, func }
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, payload: &str, _context: &HandlerContext) -> Result<String> {
        (self.func)(payload)
    }
}

/// A destination pattern bound to a handler and its fixed outbound topic
#[derive(Clone)]
pub struct HandlerBinding {
    pub pattern: DestinationPattern,
    pub topic: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("pattern", &self.pattern.as_str())
            .field("topic", &self.topic)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Information about a registered binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub pattern: String,
    pub topic: String,
    pub handler: &'static str,
    pub description: &'static str,
}

/// Ordered table of handler bindings; the first matching pattern wins
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    bindings: Vec<HandlerBinding>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a destination pattern to a handler whose output goes to `topic`
    pub fn bind<H>(mut self, pattern: &str, topic: &str, handler: H) -> Result<Self>
    where
        H: MessageHandler + 'static,
    {
        let pattern = DestinationPattern::parse(pattern)?;

        // Check for conflicts
        if let Some(existing) = self.bindings.iter().find(|b| b.pattern == pattern) {
            return Err(GatewayError::Registration(format!(
                "Pattern '{}' is already bound to '{}'",
                pattern.as_str(),
                existing.handler.name()
            )));
        }

        if topic.trim().is_empty() {
            return Err(GatewayError::Registration(format!(
                "Pattern '{}' needs an outbound topic",
                pattern.as_str()
            )));
        }

        log::info!(
            "Bound handler '{}' to {} -> {}",
            handler.name(),
            pattern.as_str(),
            topic
        );
        self.bindings.push(HandlerBinding {
            pattern,
            topic: topic.to_string(),
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    /// Get the binding for an application path (prefix already stripped)
    pub fn resolve(&self, path: &str) -> Option<&HandlerBinding> {
        self.bindings.iter().find(|binding| binding.pattern.matches(path))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &HandlerBinding> {
        self.bindings.iter()
    }

    /// Get all binding info, in registration order
    pub fn describe(&self) -> Vec<BindingInfo> {
        self.bindings
            .iter()
            .map(|binding| BindingInfo {
                pattern: binding.pattern.as_str().to_string(),
                topic: binding.topic.clone(),
                handler: binding.handler.name(),
                description: binding.handler.description(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Bindings used by the point-of-sale deployment: new orders are relayed to the orders topic
pub fn order_handlers(config: &GatewayConfig) -> Result<HandlerTable> {
    let orders_topic = format!("{}/{}", config.broker_prefix, ORDERS_TOPIC_NAME);
    HandlerTable::new().bind(NEW_ORDER_DESTINATION, &orders_topic, IdentityHandler)
}
