//! Destination router
//! Decides what an inbound SEND turns into: a handler invocation or a direct topic publish

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::core::destination::{DestinationClassifier, DestinationKind};
use crate::core::handler::{HandlerBinding, HandlerContext, HandlerTable};
use crate::error::{GatewayError, Result};

/// Content to broadcast and the topic it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

pub struct DestinationRouter {
    classifier: DestinationClassifier,
    handlers: HandlerTable,
    handler_timeout: Duration,
}

impl DestinationRouter {
    /// Create a router; every binding's topic must be a broker destination
    pub fn new(
        classifier: DestinationClassifier,
        handlers: HandlerTable,
        handler_timeout: Duration,
    ) -> Result<Self> {
        for binding in handlers.bindings() {
            if !classifier.is_topic(&binding.topic) {
                return Err(GatewayError::ConfigError(format!(
                    "Handler '{}' publishes to '{}', which is not under the broker prefix '{}'",
                    binding.handler.name(),
                    binding.topic,
                    classifier.broker_prefix()
                )));
            }
        }

        Ok(Self {
            classifier,
            handlers,
            handler_timeout,
        })
    }

    pub fn classifier(&self) -> &DestinationClassifier {
        &self.classifier
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Route an inbound message to the content it broadcasts.
    /// Errors mean the message is dropped; nothing is broadcast.
    pub async fn route(
        &self,
        connection_id: &str,
        destination: &str,
        payload: &str,
    ) -> Result<Outbound> {
        match self.classifier.classify(destination) {
            DestinationKind::Application(path) => {
                let binding = self
                    .handlers
                    .resolve(&path)
                    .ok_or_else(|| GatewayError::Unroutable(destination.to_string()))?;

                let context = HandlerContext {
                    connection_id: connection_id.to_string(),
                    destination: destination.to_string(),
                    path,
                };
                let output = self.invoke(binding, payload, context).await?;

                Ok(Outbound {
                    topic: binding.topic.clone(),
                    payload: output,
                })
            }
            DestinationKind::Topic => Ok(Outbound {
                topic: destination.to_string(),
                payload: payload.to_string(),
            }),
            DestinationKind::Unroutable => Err(GatewayError::Unroutable(destination.to_string())),
        }
    }

    /// Validate a SUBSCRIBE/UNSUBSCRIBE target
    pub fn subscription_topic<'a>(&self, destination: &'a str) -> Result<&'a str> {
        if self.classifier.is_topic(destination) {
            Ok(destination)
        } else {
            Err(GatewayError::InvalidDestination(format!(
                "{} is not under the broker prefix '{}'",
                destination,
                self.classifier.broker_prefix()
            )))
        }
    }

    /// Run a handler on its own task, bounded by the handler timeout
    async fn invoke(
        &self,
        binding: &HandlerBinding,
        payload: &str,
        context: HandlerContext,
    ) -> Result<String> {
        let handler = Arc::clone(&binding.handler);
        let name = handler.name();
        let payload = payload.to_string();

        let task = tokio::spawn(async move { handler.handle(&payload, &context).await });
        let abort = task.abort_handle();

        match timeout(self.handler_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GatewayError::Handler(format!(
                "handler '{}' did not complete: {}",
                name, e
            ))),
            Err(_) => {
                abort.abort();
                Err(GatewayError::HandlerTimeout(self.handler_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handler::{FnHandler, IdentityHandler, MessageHandler};
    use async_trait::async_trait;

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn handle(&self, payload: &str, _context: &HandlerContext) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(payload.to_string())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _payload: &str, _context: &HandlerContext) -> Result<String> {
            panic!("handler bug")
        }
    }

    fn router() -> DestinationRouter {
        let handlers = HandlerTable::new()
            .bind("/new-order", "/topic/orders", IdentityHandler)
            .unwrap()
            .bind(
                "/shout",
                "/topic/orders",
                FnHandler::new("shout", |payload: &str| Ok(payload.to_uppercase())),
            )
            .unwrap()
            .bind(
                "/reject",
                "/topic/orders",
                FnHandler::new("reject", |_: &str| {
                    Err(GatewayError::Handler("order rejected".to_string()))
                }),
            )
            .unwrap()
            .bind("/slow", "/topic/orders", SlowHandler)
            .unwrap()
            .bind("/panic", "/topic/orders", PanickingHandler)
            .unwrap();

        DestinationRouter::new(
            DestinationClassifier::new("/app", "/topic"),
            handlers,
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_application_destination_uses_bound_topic() {
        let routed = router().route("c1", "/app/new-order", "Table 5: Pizza").await.unwrap();
        assert_eq!(
            routed,
            Outbound {
                topic: "/topic/orders".to_string(),
                payload: "Table 5: Pizza".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_handler_output_replaces_payload() {
        let routed = router().route("c1", "/app/shout", "pizza").await.unwrap();
        assert_eq!(routed.payload, "PIZZA");
    }

    #[tokio::test]
    async fn test_topic_destination_publishes_directly() {
        let routed = router().route("c1", "/topic/kitchen", "fire table 5").await.unwrap();
        assert_eq!(routed.topic, "/topic/kitchen");
        assert_eq!(routed.payload, "fire table 5");
    }

    #[tokio::test]
    async fn test_unroutable_destinations() {
        let router = router();
        assert!(matches!(
            router.route("c1", "/app/unknown", "x").await,
            Err(GatewayError::Unroutable(_))
        ));
        assert!(matches!(
            router.route("c1", "/queue/orders", "x").await,
            Err(GatewayError::Unroutable(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_is_an_error() {
        let result = router().route("c1", "/app/reject", "x").await;
        assert!(matches!(result, Err(GatewayError::Handler(_))));
    }

    #[tokio::test]
    async fn test_handler_timeout() {
        let started = std::time::Instant::now();
        let result = router().route("c1", "/app/slow", "x").await;
        assert!(matches!(result, Err(GatewayError::HandlerTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let result = router().route("c1", "/app/panic", "x").await;
        assert!(matches!(result, Err(GatewayError::Handler(_))));
    }

    #[test]
    fn test_subscription_topic_validation() {
        let router = router();
        assert_eq!(router.subscription_topic("/topic/orders").unwrap(), "/topic/orders");
        assert!(router.subscription_topic("/app/new-order").is_err());
    }

    #[test]
    fn test_binding_topic_must_be_broker_destination() {
        let handlers = HandlerTable::new()
            .bind("/new-order", "/queue/orders", IdentityHandler)
            .unwrap();
        let result = DestinationRouter::new(
            DestinationClassifier::new("/app", "/topic"),
            handlers,
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(GatewayError::ConfigError(_))));
    }
}
