//! Connection handlers for the relay server.
//!
//! This module owns the HTTP routes, the producer WebSocket lifecycle and
//! the startup of the background tasks.

use crate::config::{Config, StorageBackend, StorageConfig};
use crate::discord::DiscordClient;
use crate::interactions;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::signature::{RequestVerifier, SignatureError};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ccrelay_core::{
    ChatClient, ConnectionId, ConnectionRegistry, KeyValueStore, LivenessMonitor, MemoryStore,
    MessageRouter, PresenceTracker, RouteError, RouteReport, Signal, SledStore, SubscriptionStore,
    Topic,
};
use ccrelay_protocol::interaction::subscribe_command;
use ccrelay_protocol::{ChatMessage, EventDecoder, InboundEvent, ProtocolError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Socket-level failures. Either one ends the connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(#[source] axum::Error),

    #[error("Receive failed: {0}")]
    ReceiveFailed(#[source] axum::Error),
}

/// Shared server state.
pub struct AppState {
    /// Live producer connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Topic subscriptions.
    pub subscriptions: Arc<SubscriptionStore>,
    /// Chat message router.
    pub router: MessageRouter,
    /// Backing key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// Producer payload decoder.
    pub decoder: EventDecoder,
    /// Interaction signature verifier. Without one every interaction is
    /// rejected.
    pub verifier: Option<RequestVerifier>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured public key is invalid.
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        client: Arc<dyn ChatClient>,
    ) -> Result<Self, SignatureError> {
        let subscriptions = Arc::new(SubscriptionStore::new(store.clone()));
        let verifier = if config.discord.public_key.is_empty() {
            None
        } else {
            Some(RequestVerifier::from_hex(&config.discord.public_key)?)
        };

        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            router: MessageRouter::new(subscriptions.clone(), client),
            subscriptions,
            store,
            decoder: EventDecoder::new(config.limits.max_message_size),
            verifier,
            config,
        })
    }
}

/// Open the configured key-value store.
///
/// # Errors
///
/// Returns an error if the backend cannot be opened.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sled => {
            let store = SledStore::open(&config.path)
                .with_context(|| format!("Failed to open sled store at {}", config.path))?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route(
            &state.config.transport.interactions_path,
            post(interactions::interactions_handler),
        )
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Apply the configured startup subscriptions. Failures are logged.
pub async fn seed_subscriptions(state: &AppState) {
    for seed in &state.config.subscriptions.seed {
        match state
            .subscriptions
            .subscribe(&seed.topic, &seed.channel_id)
            .await
        {
            Ok(_) => info!(topic = %seed.topic, channel = %seed.channel_id, "Seeded subscription"),
            Err(e) => {
                warn!(topic = %seed.topic, channel = %seed.channel_id, error = %e, "Failed to seed subscription")
            }
        }
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the listener cannot be
/// bound.
pub async fn run_server(config: Config) -> Result<()> {
    let store = open_store(&config.storage)?;
    info!(backend = store.name(), "Store ready");

    let discord = Arc::new(DiscordClient::new(&config.discord)?);
    if config.discord.bot_token.is_empty() {
        warn!("No bot token configured, forwarded messages will be rejected");
    }

    if config.discord.public_key.is_empty() {
        warn!("No public key configured, interactions will be rejected");
    }

    let state = Arc::new(
        AppState::new(config.clone(), store.clone(), discord.clone())
            .context("Invalid discord.public_key")?,
    );
    seed_subscriptions(&state).await;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let monitor = LivenessMonitor::new(state.registry.clone(), config.heartbeat.interval());
    info!(period = ?monitor.period(), "Starting heartbeat");
    let heartbeat = monitor.spawn_with(|report| {
        if !report.evicted.is_empty() {
            metrics::record_evictions(report.evicted.len());
        }
    });

    let tracker = PresenceTracker::new(state.registry.clone(), store, config.presence.interval());
    info!(period = ?tracker.period(), "Starting presence tracker");
    let presence = tracker.spawn_with(|silent| {
        if !silent.is_empty() {
            metrics::record_silent_topics(silent.len());
        }
    });

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Listening on port {}", addr.port());
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let registration = tokio::spawn(async move {
        if let Err(e) = discord
            .register_commands(
                &config.discord.application_id,
                &config.discord.guild_id,
                &[subscribe_command()],
            )
            .await
        {
            error!(error = %e, "Failed to register commands");
        }
    });

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    heartbeat.abort();
    presence.abort();
    registration.abort();

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler. `subscribed_topics` is `null` when the store
/// cannot be read.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let subscribed_topics = match state.subscriptions.topics().await {
        Ok(topics) => Some(topics.len()),
        Err(e) => {
            warn!(error = %e, "Failed to read subscriptions for health check");
            None
        }
    };

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.len(),
        "subscribed_topics": subscribed_topics,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.registry.len() >= state.config.limits.max_connections {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached, rejecting producer"
        );
        metrics::record_error("connection_limit");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// A chat message waiting to be routed, with the topic its connection had
/// declared when it arrived.
type QueuedMessage = (ChatMessage, Option<Topic>);

/// Handle a producer WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (connection_id, mut signals) = state.registry.register();
    info!(connection = %connection_id, "Received connection");

    let (mut sender, mut receiver) = socket.split();

    // Chat messages are routed one at a time, in arrival order.
    let (queue, pending) = mpsc::channel(state.config.limits.routing_queue.max(1));
    let routing = tokio::spawn(route_in_order(
        connection_id,
        state.router.clone(),
        pending,
    ));

    loop {
        tokio::select! {
            Some(signal) = signals.recv() => match signal {
                Signal::Ping => {
                    if let Err(e) = send_message(&mut sender, Message::Ping(Vec::new())).await {
                        warn!(connection = %connection_id, error = %e, "Failed to send ping");
                        break;
                    }
                }
                Signal::Terminate => {
                    debug!(connection = %connection_id, "Terminating unresponsive connection");
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_payload(text.as_bytes(), connection_id, &state, &queue);
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_payload(&data, connection_id, &state, &queue);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = send_message(&mut sender, Message::Pong(data)).await {
                        warn!(connection = %connection_id, error = %e, "Failed to send pong");
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    state.registry.mark_alive(connection_id);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection = %connection_id, ?frame, "Received close frame");
                    break;
                }
                Some(Err(e)) => {
                    let e = TransportError::ReceiveFailed(e);
                    warn!(connection = %connection_id, error = %e, "WebSocket error");
                    metrics::record_error("websocket");
                    break;
                }
                None => {
                    debug!(connection = %connection_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    // Pending forwards for this connection are abandoned.
    routing.abort();

    let evicted = !state.registry.unregister(connection_id);
    info!(connection = %connection_id, evicted, "Disconnected");
}

/// Decode and dispatch one producer payload. Bad payloads are dropped and
/// the connection stays open.
fn handle_payload(
    data: &[u8],
    connection_id: ConnectionId,
    state: &Arc<AppState>,
    queue: &mpsc::Sender<QueuedMessage>,
) {
    let event = match state.decoder.decode(data) {
        Ok(event) => event,
        Err(ProtocolError::UnknownType(kind)) => {
            info!(connection = %connection_id, kind = %kind, "No handler for message type");
            metrics::record_error("unknown_event");
            return;
        }
        Err(e) => {
            warn!(connection = %connection_id, error = %e, "Dropping malformed payload");
            metrics::record_error("malformed_event");
            return;
        }
    };

    metrics::record_event(event.kind());

    match event {
        InboundEvent::TopicDeclaration(declaration) => match declaration.topic() {
            Some(topic) => {
                state.registry.declare_topic(connection_id, topic);
            }
            None => {
                state.registry.clear_topic(connection_id);
            }
        },
        InboundEvent::ChatMessage(message) => {
            debug!(
                connection = %connection_id,
                sender = ?message.sender,
                name = %message.name,
                "Chat message"
            );
            let declared = state.registry.topic(connection_id);
            if let Err(e) = queue.try_send((message, declared)) {
                warn!(connection = %connection_id, error = %e, "Dropping chat message, routing queue unavailable");
                metrics::record_error("routing_queue");
            }
        }
    }
}

/// Route a connection's chat messages one after another until its queue
/// closes.
async fn route_in_order(
    connection_id: ConnectionId,
    router: MessageRouter,
    mut pending: mpsc::Receiver<QueuedMessage>,
) {
    while let Some((message, declared)) = pending.recv().await {
        let result = router.route(&message, declared.as_deref()).await;
        log_route_result(connection_id, result);
    }
}

fn log_route_result(connection_id: ConnectionId, result: Result<RouteReport, RouteError>) {
    match result {
        Ok(report) => metrics::record_forwards(report.delivered, report.failed),
        Err(RouteError::NoTopic) => {
            debug!(connection = %connection_id, "Dropping chat message without a CC");
        }
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to route chat message");
            metrics::record_error("store");
        }
    }
}

/// Send a message to the WebSocket.
async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), TransportError> {
    sender
        .send(message)
        .await
        .map_err(TransportError::SendFailed)
}


#[cfg(test)]
mod tests {
    use super::testing::{eventually, serve, test_state, RecordingClient};
    use super::*;
    use ccrelay_protocol::ForwardPayload;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test]
    async fn test_cc_change_declares_topic() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        ws.send(WsMessage::Text(
            r#"{"type":"CC_CHANGE","cc":"The Irons","guest":false}"#.into(),
        ))
        .await
        .unwrap();

        eventually(|| state.registry.snapshot_by_topic().get("The Irons") == Some(&1)).await;

        ws.send(WsMessage::Text(r#"{"type":"CC_CHANGE","cc":null}"#.into()))
            .await
            .unwrap();
        eventually(|| state.registry.snapshot_by_topic().is_empty()).await;
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_message_forwarded_to_subscribers() {
        let client = Arc::new(RecordingClient::default());
        let state = test_state(client.clone());
        state.subscriptions.subscribe("A", "c1").await.unwrap();
        state.subscriptions.subscribe("A", "c2").await.unwrap();
        state.subscriptions.subscribe("B", "c3").await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        ws.send(WsMessage::Text(
            r#"{"type":"CHAT_MESSAGE","content":"hello","sender":"A","timestamp":1,"name":"Zezima","messageType":"CLAN_CHAT"}"#.into(),
        ))
        .await
        .unwrap();

        eventually(|| client.sent().len() == 2).await;

        let mut sent = client.sent();
        sent.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            sent,
            vec![
                ("c1".to_string(), ForwardPayload::text("[Zezima]: hello")),
                ("c2".to_string(), ForwardPayload::text("[Zezima]: hello")),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_message_falls_back_to_declared_topic() {
        let client = Arc::new(RecordingClient::default());
        let state = test_state(client.clone());
        state.subscriptions.subscribe("B", "c3").await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"CC_CHANGE","cc":"B"}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Binary(
            br#"{"type":"CHAT_MESSAGE","content":"hi","name":"Bob"}"#.to_vec(),
        ))
        .await
        .unwrap();

        eventually(|| client.sent().len() == 1).await;
        assert_eq!(client.sent()[0].0, "c3");
    }

    #[tokio::test]
    async fn test_chat_messages_forwarded_in_arrival_order() {
        let client = Arc::new(RecordingClient {
            slow_on: Some("first".into()),
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let state = test_state(client.clone());
        state.subscriptions.subscribe("A", "c1").await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        for content in ["first", "second", "third"] {
            let event = serde_json::json!({
                "type": "CHAT_MESSAGE",
                "content": content,
                "sender": "A",
                "name": "n",
            });
            ws.send(WsMessage::Text(event.to_string())).await.unwrap();
        }

        eventually(|| client.sent().len() == 3).await;
        let lines: Vec<String> = client.sent().into_iter().map(|(_, p)| p.content).collect();
        assert_eq!(lines, vec!["[n]: first", "[n]: second", "[n]: third"]);
    }

    #[tokio::test]
    async fn test_topic_change_does_not_reroute_queued_messages() {
        let client = Arc::new(RecordingClient {
            slow_on: Some("first".into()),
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let state = test_state(client.clone());
        state.subscriptions.subscribe("A", "ca").await.unwrap();
        state.subscriptions.subscribe("B", "cb").await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        for event in [
            r#"{"type":"CC_CHANGE","cc":"A"}"#,
            r#"{"type":"CHAT_MESSAGE","content":"first","name":"n"}"#,
            r#"{"type":"CHAT_MESSAGE","content":"second","name":"n"}"#,
            r#"{"type":"CC_CHANGE","cc":"B"}"#,
            r#"{"type":"CHAT_MESSAGE","content":"third","name":"n"}"#,
        ] {
            ws.send(WsMessage::Text(event.into())).await.unwrap();
        }

        eventually(|| client.sent().len() == 3).await;
        let sent: Vec<(String, String)> = client
            .sent()
            .into_iter()
            .map(|(channel, p)| (channel, p.content))
            .collect();
        assert_eq!(
            sent,
            vec![
                ("ca".to_string(), "[n]: first".to_string()),
                ("ca".to_string(), "[n]: second".to_string()),
                ("cb".to_string(), "[n]: third".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_payloads_keep_connection_open() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        for bad in ["not json", r#"{"type":"LOGIN"}"#, r#"{"type":"CHAT_MESSAGE"}"#] {
            ws.send(WsMessage::Text(bad.into())).await.unwrap();
        }
        ws.send(WsMessage::Text(r#"{"type":"CC_CHANGE","cc":"A"}"#.into()))
            .await
            .unwrap();

        eventually(|| state.registry.snapshot_by_topic().get("A") == Some(&1)).await;
    }

    #[tokio::test]
    async fn test_close_unregisters_connection() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;

        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        eventually(|| state.registry.len() == 1).await;

        ws.close(None).await.unwrap();
        eventually(|| state.registry.is_empty()).await;
    }

    #[tokio::test]
    async fn test_unresponsive_connection_is_terminated() {
        let state = test_state(Arc::default());
        let addr = serve(state.clone()).await;
        let monitor = LivenessMonitor::new(state.registry.clone(), Duration::from_secs(30));

        // The client never polls its stream, so pings go unanswered.
        let (mut ws, _) = connect_async(format!("ws://{addr}/")).await.unwrap();
        eventually(|| state.registry.len() == 1).await;

        assert_eq!(monitor.tick().pinged, 1);
        assert_eq!(monitor.tick().evicted.len(), 1);
        assert!(state.registry.is_empty());

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Ping(_))) => continue,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => break,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Arc::default());
        state.subscriptions.subscribe("A", "c1").await.unwrap();
        state.subscriptions.subscribe("B", "c1").await.unwrap();
        let addr = serve(state).await;

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["subscribed_topics"], 2);
    }
}
