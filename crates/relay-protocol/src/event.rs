//! Producer event types.
//!
//! Every payload a producer sends is a JSON object whose `type` field selects
//! the event kind.

use serde::{Deserialize, Serialize};

/// `type` tag of a chat message event.
pub const CHAT_MESSAGE: &str = "CHAT_MESSAGE";

/// `type` tag of a clan chat change event.
pub const CC_CHANGE: &str = "CC_CHANGE";

/// An event received from a producer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// A chat line to forward.
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(ChatMessage),

    /// The producer declared which clan chat it is in.
    #[serde(rename = "CC_CHANGE")]
    TopicDeclaration(TopicDeclaration),
}

impl InboundEvent {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::ChatMessage(_) => "chat_message",
            InboundEvent::TopicDeclaration(_) => "cc_change",
        }
    }
}

/// Category of a chat line as reported by the game client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Messages typed by players.
    #[serde(rename = "CLAN_CHAT")]
    ClanChat,
    /// Broadcasts such as loot drops and deaths.
    #[serde(rename = "CLAN_MESSAGE")]
    ClanMessage,
    #[serde(other)]
    Other,
}

/// Producer-side timestamp. Clients send either epoch millis or a
/// preformatted string; the relay only carries it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

/// A clan chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text.
    pub content: String,

    /// Clan chat the line was sent in. This is the routing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// Display name of the author.
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,

    #[serde(
        rename = "messageType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub message_type: Option<MessageKind>,
}

impl ChatMessage {
    /// Create a chat message routed by `sender`.
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender: Some(sender.into()),
            name: name.into(),
            timestamp: None,
            message_type: None,
        }
    }

    /// The embedded routing key, if present and non-empty.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref().filter(|s| !s.is_empty())
    }

    /// The line as it appears in a subscriber channel.
    #[must_use]
    pub fn chat_line(&self) -> String {
        format!("[{}]: {}", self.name, self.content)
    }
}

/// A clan chat change. A missing or empty `cc` means the producer left its
/// clan chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDeclaration {
    #[serde(default)]
    pub cc: Option<String>,

    /// Whether the producer joined as a guest.
    #[serde(default)]
    pub guest: bool,
}

impl TopicDeclaration {
    /// Create a declaration for `cc`.
    #[must_use]
    pub fn new(cc: impl Into<String>) -> Self {
        Self {
            cc: Some(cc.into()),
            guest: false,
        }
    }

    /// The declared topic, or `None` when the declaration clears it.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        self.cc.as_deref().filter(|cc| !cc.is_empty())
    }
}

/// Body of an outbound chat-platform message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPayload {
    pub content: String,
    pub tts: bool,
    pub allow_mentions: bool,
}

impl ForwardPayload {
    /// Plain text message with text-to-speech and mentions disabled.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tts: false,
            allow_mentions: false,
        }
    }
}

impl From<&ChatMessage> for ForwardPayload {
    fn from(message: &ChatMessage) -> Self {
        ForwardPayload::text(message.chat_line())
    }
}
