//! Interactions webhook.
//!
//! Handles the chat platform's ping and the `subscribe` slash command. Every
//! request must carry a valid signature from the application's public key.

use crate::handlers::AppState;
use crate::metrics;
use crate::signature::SignatureError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use ccrelay_core::StoreError;
use ccrelay_protocol::interaction::{
    Interaction, InteractionResponse, InteractionType, CC_OPTION, SUBSCRIBE_COMMAND,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors answering an interaction.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] SignatureError),

    #[error("Malformed interaction: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported interaction type: {0:?}")]
    Unsupported(InteractionType),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing required option: {0}")]
    MissingOption(&'static str),

    #[error("Interaction has no channel")]
    MissingChannel,

    #[error("Failed to store subscription: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for InteractionError {
    fn into_response(self) -> Response {
        let status = match &self {
            InteractionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            InteractionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// `POST` handler for the interactions endpoint.
pub async fn interactions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InteractionResponse>, InteractionError> {
    match verify_and_handle(&state, &headers, &body).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            match &e {
                InteractionError::Store(_) => error!(error = %e, "Interaction failed"),
                _ => warn!(error = %e, "Rejected interaction"),
            }
            metrics::record_error("interaction");
            Err(e)
        }
    }
}

async fn verify_and_handle(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<InteractionResponse, InteractionError> {
    state
        .verifier
        .as_ref()
        .ok_or(SignatureError::NotConfigured)?
        .verify(headers, body)?;

    let interaction: Interaction = serde_json::from_slice(body)?;
    handle_interaction(state, &interaction).await
}

/// Answer one interaction.
///
/// # Errors
///
/// Returns an error for unsupported interactions, malformed commands, or if
/// the subscription cannot be stored.
pub async fn handle_interaction(
    state: &AppState,
    interaction: &Interaction,
) -> Result<InteractionResponse, InteractionError> {
    if interaction.kind == InteractionType::Ping {
        return Ok(InteractionResponse::pong());
    }

    let invocation = interaction
        .invocation()
        .ok_or(InteractionError::Unsupported(interaction.kind))?;

    if invocation.command_name != SUBSCRIBE_COMMAND {
        return Err(InteractionError::UnknownCommand(
            invocation.command_name.to_string(),
        ));
    }

    let cc = invocation
        .string_arg(CC_OPTION)
        .ok_or(InteractionError::MissingOption(CC_OPTION))?;
    let channel_id = invocation
        .origin_channel_id
        .ok_or(InteractionError::MissingChannel)?;

    state.subscriptions.subscribe(cc, channel_id).await?;
    metrics::record_subscription();
    info!(topic = %cc, channel = %channel_id, "Subscribed channel to CC");

    Ok(InteractionResponse::message(format!(
        "subscribed channel to CC \"{cc}\""
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{serve, test_state};
    use crate::signature::testing::{sign, TEST_TIMESTAMP};
    use crate::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use ccrelay_protocol::interaction::ResponseType;
    use serde_json::{json, Value};

    fn interaction(value: Value) -> Interaction {
        serde_json::from_value(value).unwrap()
    }

    fn subscribe(cc: &str, channel: &str) -> Interaction {
        interaction(json!({
            "type": 2,
            "channel_id": channel,
            "data": {"name": "subscribe", "options": [{"name": "cc", "value": cc}]}
        }))
    }

    #[tokio::test]
    async fn test_ping() {
        let state = test_state(Arc::default());
        let response = handle_interaction(&state, &interaction(json!({"type": 1})))
            .await
            .unwrap();
        assert_eq!(response.kind, ResponseType::Pong);
    }

    #[tokio::test]
    async fn test_subscribe_command() {
        let state = test_state(Arc::default());

        let response = handle_interaction(&state, &subscribe("The Irons", "c1"))
            .await
            .unwrap();
        assert_eq!(
            response,
            InteractionResponse::message("subscribed channel to CC \"The Irons\"")
        );
        assert_eq!(
            state.subscriptions.channels("The Irons").await.unwrap(),
            vec!["c1"]
        );

        // Repeating the command is harmless.
        handle_interaction(&state, &subscribe("The Irons", "c1"))
            .await
            .unwrap();
        assert_eq!(
            state.subscriptions.channels("The Irons").await.unwrap(),
            vec!["c1"]
        );
    }

    #[tokio::test]
    async fn test_rejected_interactions() {
        let state = test_state(Arc::default());

        let unknown = interaction(json!({
            "type": 2, "channel_id": "c1", "data": {"name": "unsubscribe", "options": []}
        }));
        assert!(matches!(
            handle_interaction(&state, &unknown).await,
            Err(InteractionError::UnknownCommand(name)) if name == "unsubscribe"
        ));

        let no_cc = interaction(json!({
            "type": 2, "channel_id": "c1", "data": {"name": "subscribe"}
        }));
        assert!(matches!(
            handle_interaction(&state, &no_cc).await,
            Err(InteractionError::MissingOption("cc"))
        ));

        let no_channel = interaction(json!({
            "type": 2, "data": {"name": "subscribe", "options": [{"name": "cc", "value": "A"}]}
        }));
        assert!(matches!(
            handle_interaction(&state, &no_channel).await,
            Err(InteractionError::MissingChannel)
        ));

        let component = interaction(json!({"type": 3}));
        assert!(matches!(
            handle_interaction(&state, &component).await,
            Err(InteractionError::Unsupported(InteractionType::MessageComponent))
        ));
    }

    async fn post_interaction(
        addr: std::net::SocketAddr,
        body: &Value,
        signature: Option<String>,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(body).unwrap();
        let mut request = reqwest::Client::new()
            .post(format!("http://{addr}/interactions"))
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, TEST_TIMESTAMP);
        }
        request.body(body).send().await.unwrap()
    }

    fn signed(body: &Value) -> Option<String> {
        Some(sign(&serde_json::to_vec(body).unwrap()))
    }

    #[tokio::test]
    async fn test_interactions_endpoint() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;

        let ping = json!({"type": 1});
        let response = post_interaction(addr, &ping, signed(&ping)).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.json::<Value>().await.unwrap(), json!({"type": 1}));

        let command = json!({
            "type": 2,
            "channel_id": "965757702376681576",
            "data": {"name": "subscribe", "options": [{"type": 3, "name": "cc", "value": "The Irons"}]}
        });
        let response = post_interaction(addr, &command, signed(&command)).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let body: Value = response.json().await.unwrap();
        assert_eq!(
            body,
            json!({"type": 4, "data": {"content": "subscribed channel to CC \"The Irons\""}})
        );
        assert_eq!(
            state.subscriptions.channels("The Irons").await.unwrap(),
            vec!["965757702376681576"]
        );

        let unknown = json!({"type": 2, "data": {"name": "nope"}});
        let rejected = post_interaction(addr, &unknown, signed(&unknown)).await;
        assert_eq!(rejected.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsigned_interactions_are_rejected() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;

        let command = json!({
            "type": 2,
            "channel_id": "c1",
            "data": {"name": "subscribe", "options": [{"name": "cc", "value": "The Irons"}]}
        });

        let missing = post_interaction(addr, &command, None).await;
        assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

        let other_body = json!({"type": 1});
        let wrong = post_interaction(addr, &command, signed(&other_body)).await;
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

        let garbage = post_interaction(addr, &command, Some("00".repeat(64))).await;
        assert_eq!(garbage.status(), reqwest::StatusCode::UNAUTHORIZED);

        assert!(state
            .subscriptions
            .channels("The Irons")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rejects_everything_without_public_key() {
        let mut state = test_state(Arc::default());
        Arc::get_mut(&mut state).unwrap().verifier = None;
        let addr = serve(state).await;

        let ping = json!({"type": 1});
        let response = post_interaction(addr, &ping, signed(&ping)).await;
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    }
}
