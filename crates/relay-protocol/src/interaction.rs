//! Chat-platform interaction payloads.
//!
//! The chat platform delivers slash-command invocations to the relay's
//! interactions webhook and expects a typed response. Only the subset the
//! relay handles is modelled here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the subscribe command.
pub const SUBSCRIBE_COMMAND: &str = "subscribe";

/// Name of the subscribe command's clan chat option.
pub const CC_OPTION: &str = "cc";

/// Interaction type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum InteractionType {
    Ping = 1,
    ApplicationCommand = 2,
    MessageComponent = 3,
    Autocomplete = 4,
    ModalSubmit = 5,
}

impl From<InteractionType> for u8 {
    fn from(it: InteractionType) -> u8 {
        it as u8
    }
}

impl TryFrom<u8> for InteractionType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(InteractionType::Ping),
            2 => Ok(InteractionType::ApplicationCommand),
            3 => Ok(InteractionType::MessageComponent),
            4 => Ok(InteractionType::Autocomplete),
            5 => Ok(InteractionType::ModalSubmit),
            _ => Err("Invalid interaction type"),
        }
    }
}

/// Interaction response type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ResponseType {
    Pong = 1,
    ChannelMessageWithSource = 4,
}

impl From<ResponseType> for u8 {
    fn from(rt: ResponseType) -> u8 {
        rt as u8
    }
}

impl TryFrom<u8> for ResponseType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ResponseType::Pong),
            4 => Ok(ResponseType::ChannelMessageWithSource),
            _ => Err("Invalid response type"),
        }
    }
}

/// An incoming interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: InteractionType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CommandData>,

    /// Channel the command was invoked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Command name and arguments of an application command interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

/// A single supplied command argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOption {
    pub name: String,
    pub value: Value,
}

/// A decoded command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation<'a> {
    pub command_name: &'a str,
    pub args: &'a [CommandOption],
    pub origin_channel_id: Option<&'a str>,
}

impl CommandInvocation<'_> {
    /// String value of the argument called `name`.
    #[must_use]
    pub fn string_arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|opt| opt.name == name)
            .and_then(|opt| opt.value.as_str())
    }
}

impl Interaction {
    /// The command invocation, for application command interactions.
    #[must_use]
    pub fn invocation(&self) -> Option<CommandInvocation<'_>> {
        if self.kind != InteractionType::ApplicationCommand {
            return None;
        }
        let data = self.data.as_ref()?;
        Some(CommandInvocation {
            command_name: &data.name,
            args: &data.options,
            origin_channel_id: self.channel_id.as_deref(),
        })
    }
}

/// Response body for an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: ResponseType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Message content of an interaction response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseData {
    pub content: String,
}

impl InteractionResponse {
    /// Reply to a ping.
    #[must_use]
    pub fn pong() -> Self {
        Self {
            kind: ResponseType::Pong,
            data: None,
        }
    }

    /// Reply with a message in the invoking channel.
    #[must_use]
    pub fn message(content: impl Into<String>) -> Self {
        Self {
            kind: ResponseType::ChannelMessageWithSource,
            data: Some(ResponseData {
                content: content.into(),
            }),
        }
    }
}

/// Slash command registration body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub options: Vec<OptionDefinition>,
    /// 1 = chat input command.
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Command option registration body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDefinition {
    /// 3 = string.
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Definition of the `subscribe` command.
#[must_use]
pub fn subscribe_command() -> CommandDefinition {
    CommandDefinition {
        name: SUBSCRIBE_COMMAND.to_string(),
        description: "Subscribe to a CC".to_string(),
        options: vec![OptionDefinition {
            kind: 3,
            name: CC_OPTION.to_string(),
            description: "CC to subscribe to".to_string(),
            required: true,
        }],
        kind: 1,
    }
}
