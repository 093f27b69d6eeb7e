//! Persistent topic subscriptions.
//!
//! The whole mapping is stored as one document, `{ topic: { channel_id: true } }`,
//! and rewritten in full on every change. Writers are serialized by a single
//! lock held across read, mutate and write; readers never take it and see
//! either the previous or the next complete document.

use crate::store::{load_or_default, save, KeyValueStore, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Key the subscription mapping is persisted under.
pub const SUBSCRIPTIONS_KEY: &str = "subscriptions";

/// A topic identifier (clan chat name).
pub type Topic = String;

/// A chat-platform channel identifier.
pub type ChannelId = String;

type SubscriptionMap = BTreeMap<Topic, BTreeMap<ChannelId, bool>>;

/// Topic to subscriber channel mapping over a [`KeyValueStore`].
pub struct SubscriptionStore {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl SubscriptionStore {
    /// Create a subscription store persisting into `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Subscribe `channel_id` to `topic`.
    ///
    /// Returns `true` if the channel was not already subscribed. Subscribing
    /// twice leaves the mapping unchanged but still rewrites it.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be read or written.
    pub async fn subscribe(&self, topic: &str, channel_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut mapping: SubscriptionMap =
            load_or_default(self.store.as_ref(), SUBSCRIPTIONS_KEY).await?;
        let added = mapping
            .entry(topic.to_string())
            .or_default()
            .insert(channel_id.to_string(), true)
            .is_none();

        save(self.store.as_ref(), SUBSCRIPTIONS_KEY, &mapping).await?;

        debug!(topic = %topic, channel = %channel_id, added, "Subscribed channel");
        Ok(added)
    }

    /// Channels subscribed to `topic`. Unknown topics have none.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be read.
    pub async fn channels(&self, topic: &str) -> Result<Vec<ChannelId>, StoreError> {
        let mut mapping: SubscriptionMap =
            load_or_default(self.store.as_ref(), SUBSCRIPTIONS_KEY).await?;
        Ok(mapping
            .remove(topic)
            .map(|channels| channels.into_keys().collect())
            .unwrap_or_default())
    }

    /// Every topic with at least one subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping cannot be read.
    pub async fn topics(&self) -> Result<Vec<Topic>, StoreError> {
        let mapping: SubscriptionMap =
            load_or_default(self.store.as_ref(), SUBSCRIPTIONS_KEY).await?;
        Ok(mapping
            .into_iter()
            .filter(|(_, channels)| !channels.is_empty())
            .map(|(topic, _)| topic)
            .collect())
    }
}
