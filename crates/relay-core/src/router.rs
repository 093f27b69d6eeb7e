//! Routing of producer chat messages to subscriber channels.

use crate::store::StoreError;
use crate::subscriptions::{ChannelId, SubscriptionStore, Topic};
use async_trait::async_trait;
use ccrelay_protocol::{ChatMessage, ForwardPayload};
use futures_util::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned by a [`ChatClient`].
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The request could not be sent or its response not read.
    #[error("Request failed: {0}")]
    Request(String),

    /// The chat platform rejected the request.
    #[error("Chat platform returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Errors that stop a message from being routed at all.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Neither the message nor its connection names a topic.
    #[error("Message has no topic")]
    NoTopic,

    /// Subscribers could not be looked up.
    #[error("Subscriber lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// The chat platform's message-sending capability.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post `payload` to `channel_id`.
    async fn send_message(
        &self,
        channel_id: &str,
        payload: &ForwardPayload,
    ) -> Result<(), ForwardError>;
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    /// Topic the message was routed by.
    pub topic: Topic,
    /// Channels the message was delivered to.
    pub delivered: usize,
    /// Channels the send failed for.
    pub failed: usize,
}

/// Forwards chat messages to the channels subscribed to their topic.
#[derive(Clone)]
pub struct MessageRouter {
    subscriptions: Arc<SubscriptionStore>,
    client: Arc<dyn ChatClient>,
}

impl MessageRouter {
    /// Create a router.
    #[must_use]
    pub fn new(subscriptions: Arc<SubscriptionStore>, client: Arc<dyn ChatClient>) -> Self {
        Self {
            subscriptions,
            client,
        }
    }

    /// Pick the routing topic: the message's embedded sender, falling back to
    /// the topic its connection declared.
    #[must_use]
    pub fn resolve_topic<'a>(
        message: &'a ChatMessage,
        declared_topic: Option<&'a str>,
    ) -> Option<&'a str> {
        message
            .sender()
            .or_else(|| declared_topic.filter(|t| !t.is_empty()))
    }

    /// Forward `message` to every channel subscribed to its topic.
    ///
    /// Sends run concurrently. A failed send is logged and counted without
    /// affecting the others.
    ///
    /// # Errors
    ///
    /// Returns an error if no topic can be resolved or the subscriber lookup
    /// fails.
    pub async fn route(
        &self,
        message: &ChatMessage,
        declared_topic: Option<&str>,
    ) -> Result<RouteReport, RouteError> {
        let topic = Self::resolve_topic(message, declared_topic).ok_or(RouteError::NoTopic)?;
        let channels = self.subscriptions.channels(topic).await?;
        let payload = ForwardPayload::from(message);

        let results = join_all(channels.iter().map(|channel| self.forward(channel, &payload))).await;
        let delivered = results.iter().filter(|ok| **ok).count();

        debug!(
            topic = %topic,
            delivered,
            failed = results.len() - delivered,
            "Routed chat message"
        );

        Ok(RouteReport {
            topic: topic.to_string(),
            delivered,
            failed: results.len() - delivered,
        })
    }

    async fn forward(&self, channel: &ChannelId, payload: &ForwardPayload) -> bool {
        match self.client.send_message(channel, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to forward message");
                false
            }
        }
    }
}
