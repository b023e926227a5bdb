//! Subscription registry
//! Tracks which connections listen on which broker topics

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::core::connection::Connection;
use crate::error::{GatewayError, Result};

/// One connection's binding to one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: String,
    pub topic: String,
    /// Client-chosen id, echoed on every MESSAGE delivered through this subscription
    pub subscription_id: String,
}

/// A subscriber as seen from a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub connection_id: String,
    pub subscription_id: String,
}

/// Both indexes live behind one lock so every read is a consistent snapshot
#[derive(Debug, Default)]
struct RegistryState {
    /// topic -> connection id -> subscription id
    topics: HashMap<String, HashMap<String, String>>,
    /// connection id -> subscription id -> topic
    connections: HashMap<String, HashMap<String, String>>,
}

impl RegistryState {
    fn insert(&mut self, connection_id: &str, topic: &str, subscription_id: &str) -> Result<bool> {
        if self
            .topics
            .get(topic)
            .map_or(false, |members| members.contains_key(connection_id))
        {
            return Ok(false);
        }

        if let Some(existing) = self
            .connections
            .get(connection_id)
            .and_then(|owned| owned.get(subscription_id))
        {
            return Err(GatewayError::DuplicateSubscription(format!(
                "id '{}' already subscribes to {}",
                subscription_id, existing
            )));
        }

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string(), subscription_id.to_string());
        self.connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(subscription_id.to_string(), topic.to_string());

        Ok(true)
    }

    fn remove(&mut self, connection_id: &str, topic: &str) -> Option<String> {
        let members = self.topics.get_mut(topic)?;
        let subscription_id = members.remove(connection_id)?;
        if members.is_empty() {
            self.topics.remove(topic);
        }

        if let Some(owned) = self.connections.get_mut(connection_id) {
            owned.remove(&subscription_id);
            if owned.is_empty() {
                self.connections.remove(connection_id);
            }
        }

        Some(subscription_id)
    }
}

/// Maps topics to their subscribed connections
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a topic.
    /// Idempotent per (connection, topic): returns false if the connection was already subscribed.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        topic: &str,
        subscription_id: &str,
    ) -> Result<bool> {
        self.state
            .write()
            .await
            .insert(connection_id, topic, subscription_id)
    }

    /// Subscribe only while the connection is OPEN, checked under the registry lock.
    /// Teardown marks the connection CLOSING before it clears the registry, so an
    /// entry added here is always seen and removed by that cleanup.
    pub async fn subscribe_open(
        &self,
        connection: &Connection,
        topic: &str,
        subscription_id: &str,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if !connection.is_open() {
            return Err(GatewayError::ConnectionClosed);
        }
        state.insert(&connection.id, topic, subscription_id)
    }

    /// Remove a connection's subscription to a topic; no-op if absent
    pub async fn unsubscribe(&self, connection_id: &str, topic: &str) -> bool {
        self.state.write().await.remove(connection_id, topic).is_some()
    }

    /// Remove a subscription by its client-chosen id, returning its topic
    pub async fn unsubscribe_by_id(
        &self,
        connection_id: &str,
        subscription_id: &str,
    ) -> Option<String> {
        let mut state = self.state.write().await;
        let topic = state
            .connections
            .get(connection_id)?
            .get(subscription_id)?
            .clone();
        state.remove(connection_id, &topic);
        Some(topic)
    }

    /// Drop every subscription owned by a closed connection
    pub async fn on_connection_closed(&self, connection_id: &str) -> usize {
        let mut state = self.state.write().await;
        let owned = match state.connections.remove(connection_id) {
            Some(owned) => owned,
            None => return 0,
        };

        for topic in owned.values() {
            if let Some(members) = state.topics.get_mut(topic) {
                members.remove(connection_id);
                if members.is_empty() {
                    state.topics.remove(topic);
                }
            }
        }

        owned.len()
    }

    /// Snapshot of a topic's subscribers
    pub async fn subscribers_of(&self, topic: &str) -> Vec<Subscriber> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(|members| {
                members
                    .iter()
                    .map(|(connection_id, subscription_id)| Subscriber {
                        connection_id: connection_id.clone(),
                        subscription_id: subscription_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topics a connection is subscribed to
    pub async fn topics_of(&self, connection_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn subscriptions_of(&self, connection_id: &str) -> Vec<Subscription> {
        self.state
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|owned| {
                owned
                    .iter()
                    .map(|(subscription_id, topic)| Subscription {
                        connection_id: connection_id.to_string(),
                        topic: topic.clone(),
                        subscription_id: subscription_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, connection_id: &str, topic: &str) -> bool {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map_or(false, |members| members.contains_key(connection_id))
    }

    pub async fn topic_count(&self) -> usize {
        self.state.read().await.topics.len()
    }

    pub async fn subscription_count(&self) -> usize {
        self.state
            .read()
            .await
            .connections
            .values()
            .map(|owned| owned.len())
            .sum()
    }
}
