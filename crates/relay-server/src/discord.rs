//! Discord REST client.
//!
//! Only the two calls the relay needs are implemented: posting a message to a
//! channel and installing missing guild commands.

use crate::config::{DiscordConfig, Secret};
use async_trait::async_trait;
use ccrelay_core::{ChatClient, ForwardError};
use ccrelay_protocol::interaction::CommandDefinition;
use ccrelay_protocol::ForwardPayload;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, info};

/// An installed command as listed by the API.
#[derive(Debug, Deserialize)]
struct InstalledCommand {
    name: String,
}

/// Client for the Discord REST API.
#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    token: Secret,
}

impl DiscordClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &DiscordConfig) -> Result<Self, ForwardError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                "DiscordBot (https://github.com/ccrelay/ccrelay, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .build()
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(path))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bot {}", self.token.expose()),
            )
    }

    /// Send a request, turning non-success statuses into errors.
    async fn execute(&self, request: RequestBuilder) -> Result<Response, ForwardError> {
        let response = request
            .send()
            .await
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ForwardError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    /// Install every command in `commands` that the guild does not have yet.
    /// Commands are matched by name only.
    ///
    /// Does nothing if the application or guild ID is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or installing commands fails.
    pub async fn register_commands(
        &self,
        application_id: &str,
        guild_id: &str,
        commands: &[CommandDefinition],
    ) -> Result<(), ForwardError> {
        if application_id.is_empty() || guild_id.is_empty() {
            debug!("No application or guild configured, skipping command registration");
            return Ok(());
        }

        let path = format!("applications/{application_id}/guilds/{guild_id}/commands");

        let installed: Vec<InstalledCommand> = self
            .execute(self.request(Method::GET, &path))
            .await?
            .json()
            .await
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        for command in commands {
            if installed.iter().any(|c| c.name == command.name) {
                info!(command = %command.name, "Command already installed");
                continue;
            }

            info!(command = %command.name, "Installing command");
            self.execute(self.request(Method::POST, &path).json(command))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn send_message(
        &self,
        channel_id: &str,
        payload: &ForwardPayload,
    ) -> Result<(), ForwardError> {
        let path = format!("channels/{channel_id}/messages");
        self.execute(self.request(Method::POST, &path).json(payload))
            .await?;
        debug!(channel = %channel_id, "Forwarded message");
        Ok(())
    }
}
