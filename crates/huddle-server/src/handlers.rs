//! Connection handlers for Huddle server.
//!
//! This module wires the WebSocket transport to a [`Session`] per
//! connection and mounts the HTTP API.

use crate::api;
use crate::auth::{self, JwtVerifier};
use crate::config::{Config, StorageBackend};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use huddle_core::{
    ConnectionHandle, Error, Hub, IdentityStore, MemoryIdentityStore, MemoryMessageStore,
    MessageStore, Router as RoomRouter, RouterConfig, Session, SessionState,
};
use huddle_db::{Database, SqliteStore};
use huddle_protocol::{codec, ClientEvent, ProtocolError, ServerEvent};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// How long a connection may stay unauthenticated.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// Registry, router, and stores shared by every session.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Open WebSocket connections.
    connections: AtomicUsize,
}

impl AppState {
    /// Create app state, opening the configured storage backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        let (messages, identities): (Arc<dyn MessageStore>, Arc<dyn IdentityStore>) =
            match config.storage.backend {
                StorageBackend::Memory => {
                    info!("Using in-memory storage");
                    (
                        Arc::new(MemoryMessageStore::new()),
                        Arc::new(MemoryIdentityStore::new()),
                    )
                }
                StorageBackend::Sqlite => {
                    info!(path = %config.storage.path.display(), "Using SQLite storage");
                    let store = SqliteStore::new(Database::open(&config.storage.path)?);
                    (Arc::new(store.clone()), Arc::new(store))
                }
            };

        let router_config = RouterConfig {
            max_rooms_per_connection: config.limits.max_rooms_per_connection,
            room_capacity: config.limits.room_capacity,
            ..RouterConfig::default()
        };
        let verifier = Arc::new(JwtVerifier::new(&config.auth.jwt_secret));

        let hub = Hub::new(
            RoomRouter::with_config(router_config),
            messages,
            identities,
            verifier,
        );

        Ok(Self {
            hub: Arc::new(hub),
            config,
            connections: AtomicUsize::new(0),
        })
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Holds one connection slot until dropped.
struct ConnectionSlot(Arc<AppState>);

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(state.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/api/messages",
            post(api::send_message).get(api::list_messages),
        )
        .route("/api/users", get(api::list_users))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api)
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.router().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connection_count(),
        "users": state.hub.registry().online_users().len(),
        "rooms": stats.room_count,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let token = auth::bearer_token(&headers)
        .map(str::to_string)
        .or(params.token)
        .filter(|token| !token.is_empty());

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, token, slot))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    token: Option<String>,
    _slot: ConnectionSlot,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut session, mut outbox) = Session::new(state.hub.clone());
    let connection = session.handle();
    debug!(%connection, has_token = token.is_some(), "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    if let Some(token) = token {
        if session.authenticate(&token).is_err() {
            metrics::record_auth_failure();
        }
    }

    // Clients that speak MessagePack get MessagePack back
    let mut binary = false;
    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
    tokio::pin!(auth_deadline);

    // Message processing loop
    while !session.is_closed() {
        tokio::select! {
            biased;

            // Events routed to this connection
            Some(envelope) = outbox.recv() => {
                if send_event(&mut sender, &envelope.event, binary).await.is_err() {
                    break;
                }
            }

            () = &mut auth_deadline, if matches!(session.state(), SessionState::Connecting) => {
                warn!(%connection, "Authentication timed out");
                metrics::record_auth_failure();
                let timeout = ServerEvent::error(4001, "authentication timed out");
                let _ = send_event(&mut sender, &timeout, binary).await;
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_bytes(text.len(), "inbound");

                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state.hub, &mut session, event),
                            Err(e) => {
                                if refuse_frame(&mut sender, connection, e, binary).await.is_err() {
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_bytes(data.len(), "inbound");
                        binary = true;
                        read_buffer.extend_from_slice(&data);

                        // Try to decode frames
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => dispatch(&state.hub, &mut session, event),
                                Ok(None) => break,
                                Err(e) => {
                                    // A bad length prefix leaves nothing to resync on
                                    if matches!(e, ProtocolError::FrameTooLarge(_)) {
                                        read_buffer.clear();
                                    }
                                    if refuse_frame(&mut sender, connection, e, binary)
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                            }
                            if session.is_closed() {
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%connection, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(%connection, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if session.is_closed() {
        // Rejected: deliver the reason, then close
        while let Ok(envelope) = outbox.try_recv() {
            if send_event(&mut sender, &envelope.event, binary).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    }

    // Cleanup: leave every room, queue the offline write
    drop(session.close());
    metrics::set_active_rooms(state.hub.router().room_count());

    debug!(%connection, "WebSocket disconnected");
}

/// Feed one decoded event to the session.
fn dispatch(hub: &Hub, session: &mut Session, event: ClientEvent) {
    metrics::record_event(event.name(), "inbound");
    let joins_room = matches!(event, ClientEvent::Join(_) | ClientEvent::JoinPrivate(_));
    match session.handle_event(event) {
        Ok(()) if joins_room => metrics::set_active_rooms(hub.router().room_count()),
        Ok(()) => {}
        Err(err) => {
            metrics::record_error(err.kind());
            if matches!(err, Error::Auth(_)) {
                metrics::record_auth_failure();
            }
        }
    }
}

/// Report an undecodable frame. The connection stays open.
async fn refuse_frame(
    sender: &mut WsSender,
    connection: ConnectionHandle,
    err: ProtocolError,
    binary: bool,
) -> Result<()> {
    warn!(%connection, error = %err, "Malformed frame");
    metrics::record_error("malformed");
    let err = Error::from(err);
    send_event(sender, &ServerEvent::error(err.wire_code(), err.to_string()), binary).await
}

/// Send an event in the connection's wire format.
async fn send_event(sender: &mut WsSender, event: &ServerEvent, binary: bool) -> Result<()> {
    let message = if binary {
        match codec::encode(event) {
            Ok(data) => Message::Binary(data.to_vec()),
            Err(e) => {
                error!(event = event.name(), error = %e, "Failed to encode event");
                return Ok(());
            }
        }
    } else {
        match codec::encode_json(event) {
            Ok(text) => Message::Text(text),
            Err(e) => {
                error!(event = event.name(), error = %e, "Failed to encode event");
                return Ok(());
            }
        }
    };

    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_event(event.name(), "outbound");
    metrics::record_bytes(len, "outbound");
    sender.send(message).await?;
    Ok(())
}
