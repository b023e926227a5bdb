//! Broadcast engine
//!
//! Fans a payload out to every subscriber of a topic. The subscriber set is
//! resolved once; each delivery then runs on its own task so a failed or slow
//! recipient never holds up the others. Delivery is best-effort and
//! at-most-once: nothing is retried or kept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::core::connection::ConnectionManager;
use crate::core::frame::Frame;
use crate::core::subscription::SubscriptionRegistry;

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

pub struct Broadcaster {
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionManager>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            connections,
            registry,
        }
    }

    /// Deliver `payload` to the current subscribers of `topic`
    pub async fn publish(&self, topic: &str, payload: &str) -> BroadcastStats {
        let start = Instant::now();
        let subscribers = self.registry.subscribers_of(topic).await;
        if subscribers.is_empty() {
            log::debug!("No subscribers on {}", topic);
            return BroadcastStats {
                elapsed: start.elapsed(),
                ..BroadcastStats::default()
            };
        }

        let ids: Vec<&str> = subscribers
            .iter()
            .map(|subscriber| subscriber.connection_id.as_str())
            .collect();
        let targets = self.connections.get_many(&ids).await;

        let topic: Arc<str> = Arc::from(topic);
        let payload: Arc<str> = Arc::from(payload);
        let mut send_tasks = Vec::with_capacity(subscribers.len());

        for (subscriber, connection) in subscribers.iter().zip(targets) {
            let connection = match connection {
                Some(connection) => connection,
                None => {
                    log::debug!(
                        "Subscriber {} on {} has no live connection",
                        subscriber.connection_id,
                        topic
                    );
                    continue;
                }
            };

            let topic = Arc::clone(&topic);
            let payload = Arc::clone(&payload);
            let subscription_id = subscriber.subscription_id.clone();

            // Create async task for each send operation
            send_tasks.push(tokio::spawn(async move {
                let message_id = Uuid::new_v4().to_string();
                let frame = Frame::message(&topic, &subscription_id, &message_id, &payload);
                if connection.send_text(&frame.encode()) {
                    log::trace!("Message {} sent to connection {}", message_id, connection.id);
                    true
                } else {
                    log::debug!("Failed to deliver to connection {} on {}", connection.id, topic);
                    false
                }
            }));
        }

        // Wait for all send operations to complete concurrently
        let results = futures_util::future::join_all(send_tasks).await;
        let delivered = results
            .into_iter()
            .filter_map(|result| result.ok())
            .filter(|&success| success)
            .count();

        let stats = BroadcastStats {
            recipients: subscribers.len(),
            delivered,
            failed: subscribers.len() - delivered,
            elapsed: start.elapsed(),
        };
        log::debug!(
            "Broadcast on {}: {}/{} delivered in {:?}",
            topic,
            stats.delivered,
            stats.recipients,
            stats.elapsed
        );
        stats
    }
}
