//! Connection gateway.
//!
//! Terminates WebSocket connections, runs admission (authenticate, resolve
//! the document, check permission), attaches admitted connections to their
//! document hub and pumps frames between the socket and the hub until the
//! connection ends.

use crate::collaborators::{
    AuthError, Authenticator, Credentials, DocumentHandle, DocumentLookup, LookupError,
    PermissionPolicy, User,
};
use crate::config::Config;
use crate::memory::{MemoryDirectory, TokenAuthenticator};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    ClientConnection, ConnectionPhase, ConnectionState, DetachReason, HubRegistry, RegistryConfig,
    RegistryError,
};
use tandem_protocol::{codec, message::EXTENSION_DOCUMENT_DELETED, MessageType};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

/// WebSocket close codes sent by the gateway.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The server is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Missing or malformed document parameter.
    pub const BAD_PATH: u16 = 4400;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4401;
    /// The user may not read the document.
    pub const FORBIDDEN: u16 = 4403;
    /// The document does not exist.
    pub const NOT_FOUND: u16 = 4404;
    /// The hub dropped the connection.
    pub const EVICTED: u16 = 4408;
    /// The document was deleted.
    pub const DOCUMENT_DELETED: u16 = 4410;
    /// Nothing arrived within the heartbeat timeout.
    pub const HEARTBEAT_TIMEOUT: u16 = 4504;
    /// The server cannot take the connection.
    pub const SERVER_ERROR: u16 = 4500;
}

/// Query parameter carrying a bearer token.
pub const TOKEN_PARAM: &str = "token";

/// Reasons a connection is refused before reaching a hub.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The document parameter is missing or malformed.
    #[error("Missing or invalid document parameter")]
    BadPath,

    /// The credentials were rejected.
    #[error("Authentication failed: {0}")]
    AuthFailed(#[from] AuthError),

    /// No such document.
    #[error("Document not found")]
    DocumentNotFound,

    /// The user may not read the document.
    #[error("Forbidden")]
    Forbidden,

    /// The server cannot take the connection right now.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl AdmissionError {
    /// WebSocket close code sent with the rejection.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::BadPath => close_code::BAD_PATH,
            AdmissionError::AuthFailed(_) => close_code::AUTH_FAILED,
            AdmissionError::DocumentNotFound => close_code::NOT_FOUND,
            AdmissionError::Forbidden => close_code::FORBIDDEN,
            AdmissionError::Unavailable(_) => close_code::SERVER_ERROR,
        }
    }

    /// Metrics label.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::BadPath => "bad_path",
            AdmissionError::AuthFailed(_) => "auth_failed",
            AdmissionError::DocumentNotFound => "not_found",
            AdmissionError::Forbidden => "forbidden",
            AdmissionError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<LookupError> for AdmissionError {
    fn from(err: LookupError) -> Self {
        match err {
            LookupError::NotFound(_) => AdmissionError::DocumentNotFound,
            LookupError::Backend(e) => AdmissionError::Unavailable(e),
        }
    }
}

impl From<RegistryError> for AdmissionError {
    fn from(err: RegistryError) -> Self {
        AdmissionError::Unavailable(err.to_string())
    }
}

/// Shared server state.
pub struct AppState {
    /// The hub registry.
    pub registry: Arc<HubRegistry>,
    /// Server configuration.
    pub config: Config,
    /// Authenticates upgrade requests.
    pub authenticator: Arc<dyn Authenticator>,
    /// Resolves document references.
    pub lookup: Arc<dyn DocumentLookup>,
    /// Authorizes users on documents.
    pub permissions: Arc<dyn PermissionPolicy>,
}

impl AppState {
    /// Create app state with the in-memory collaborators described by
    /// `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let authenticator = Arc::new(TokenAuthenticator::from_config(&config.auth));
        let directory = Arc::new(MemoryDirectory::from_config(&config.documents));
        Self::with_collaborators(config, authenticator, directory.clone(), directory)
    }

    /// Create app state with host-provided collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        lookup: Arc<dyn DocumentLookup>,
        permissions: Arc<dyn PermissionPolicy>,
    ) -> Self {
        let registry = HubRegistry::with_config(RegistryConfig {
            max_documents: config.limits.max_documents,
            max_frame_size: config.limits.max_message_size,
        });

        Self {
            registry,
            config,
            authenticator,
            lookup,
            permissions,
        }
    }
}

/// Build the HTTP router: the WebSocket endpoint and `/health`.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tandem server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?{}=<document>",
        addr, config.transport.websocket_path, config.transport.document_param
    );

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then shut the registry
/// down so every connection detaches.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let registry = Arc::clone(&state.registry);
    let sweeper = spawn_awareness_sweeper(
        Arc::clone(&registry),
        Duration::from_millis(state.config.heartbeat.awareness_timeout_ms),
    );

    let app = router(state);
    let shutdown_registry = Arc::clone(&registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down");
            shutdown_registry.shutdown();
        })
        .await
        .context("Server error")?;

    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Periodically prune stale awareness states and dispose idle hubs.
pub fn spawn_awareness_sweeper(registry: Arc<HubRegistry>, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if registry.is_shutting_down() {
                break;
            }
            let pruned = registry.sweep_awareness(timeout);
            let released = registry.release_idle();
            if pruned > 0 || released > 0 {
                debug!(pruned, released, "Awareness sweep");
            }
            metrics::set_active_documents(registry.len());
        }
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    let status = if state.registry.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    axum::Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "documents": stats.documents,
        "connections": stats.connections,
    }))
}

/// What the upgrade request carried.
#[derive(Debug, Clone)]
struct UpgradeRequest {
    document: Option<String>,
    credentials: Credentials,
}

impl UpgradeRequest {
    fn new(config: &Config, params: &HashMap<String, String>, headers: &HeaderMap) -> Self {
        let header_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
        let token = header_token.or_else(|| params.get(TOKEN_PARAM).cloned());

        Self {
            document: params.get(&config.transport.document_param).cloned(),
            credentials: Credentials { token },
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let request = UpgradeRequest::new(&state.config, &params, &headers);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, request))
}

/// Authenticate, resolve and authorize.
async fn admit(
    state: &AppState,
    request: &UpgradeRequest,
) -> Result<(User, DocumentHandle), AdmissionError> {
    let reference = request
        .document
        .as_deref()
        .filter(|d| tandem_core::validate_document_id(d).is_ok())
        .ok_or(AdmissionError::BadPath)?;

    let user = state.authenticator.authenticate(&request.credentials).await?;
    let document = state.lookup.resolve(reference).await?;

    if !state.permissions.can_read(&user, &document).await {
        return Err(AdmissionError::Forbidden);
    }

    Ok((user, document))
}

fn advance(phase: &mut ConnectionPhase, next: ConnectionPhase) {
    debug_assert!(
        phase.can_transition_to(next),
        "illegal transition {:?} -> {:?}",
        phase,
        next
    );
    trace!(from = ?phase, to = ?next, "Connection phase");
    *phase = next;
}

async fn close(socket: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    // The peer may already be gone.
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Handle a WebSocket connection from upgrade to close.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, request: UpgradeRequest) {
    let mut phase = ConnectionPhase::Connecting;
    let (mut sender, mut receiver) = socket.split();

    let admitted = match admit(&state, &request).await {
        Ok((user, document)) => {
            let (connection, outbound) =
                ClientConnection::new(user.id.clone(), state.config.limits.outbound_queue_capacity);
            state
                .registry
                .attach(document.id, connection)
                .map(|conn| (conn, outbound))
                .map_err(AdmissionError::from)
        }
        Err(e) => Err(e),
    };

    let (conn, mut outbound) = match admitted {
        Ok(admitted) => admitted,
        Err(e) => {
            advance(&mut phase, ConnectionPhase::Rejected);
            warn!(
                document = ?request.document,
                reason = e.reason(),
                error = %e,
                "Connection rejected"
            );
            metrics::record_rejection(e.reason());
            close(&mut sender, e.close_code(), &e.to_string()).await;
            advance(&mut phase, ConnectionPhase::Closed);
            return;
        }
    };

    advance(&mut phase, ConnectionPhase::Attached);
    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_active_documents(state.registry.len());
    debug!(
        connection = %conn.connection_id(),
        document = %conn.document_id(),
        "WebSocket attached"
    );

    let (reason, code) = pump(&state, &conn, &mut sender, &mut receiver, &mut outbound).await;

    advance(&mut phase, ConnectionPhase::Detached(reason));
    conn.detach(reason);
    if reason == DetachReason::Evicted {
        metrics::record_eviction();
    }
    if let Some(code) = code {
        close(&mut sender, code, &reason.to_string()).await;
    }
    advance(&mut phase, ConnectionPhase::Closed);
    metrics::set_active_documents(state.registry.len());
}

/// Move frames between the socket and the hub until the connection ends.
///
/// Returns why it ended and the close code to send, if any.
async fn pump(
    state: &AppState,
    conn: &ConnectionState,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    outbound: &mut mpsc::Receiver<bytes::Bytes>,
) -> (DetachReason, Option<u16>) {
    let heartbeat = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut ping = time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut last_seen = Instant::now();
    let mut deleted = false;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return if state.registry.is_shutting_down() {
                        (DetachReason::ServerShutdown, Some(close_code::GOING_AWAY))
                    } else if deleted {
                        (DetachReason::Evicted, Some(close_code::DOCUMENT_DELETED))
                    } else {
                        (DetachReason::Evicted, Some(close_code::EVICTED))
                    };
                };

                let kind = frame_kind(&frame);
                if kind == "deleted" {
                    deleted = true;
                }
                metrics::record_frame(kind, "outbound", frame.len());
                if sender.send(Message::Binary(frame.to_vec())).await.is_err() {
                    return (DetachReason::Error, None);
                }
            }

            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(reply) = handle_inbound(conn, &data) {
                            metrics::record_frame(frame_kind(&reply), "outbound", reply.len());
                            if sender.send(Message::Binary(reply.to_vec())).await.is_err() {
                                return (DetachReason::Error, None);
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        metrics::record_decode_error();
                        warn!(
                            connection = %conn.connection_id(),
                            document = %conn.document_id(),
                            "Dropping text message"
                        );
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            return (DetachReason::Error, None);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn.connection_id(), "Received close frame");
                        return (DetachReason::CloseFrame, None);
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn.connection_id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        return (DetachReason::Error, None);
                    }
                    None => {
                        debug!(connection = %conn.connection_id(), "WebSocket stream ended");
                        return (DetachReason::Error, None);
                    }
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() >= timeout {
                    warn!(connection = %conn.connection_id(), "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    return (DetachReason::Error, Some(close_code::HEARTBEAT_TIMEOUT));
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    return (DetachReason::Error, None);
                }
            }
        }
    }
}

/// Process one inbound frame. Malformed frames are dropped.
fn handle_inbound(conn: &ConnectionState, data: &[u8]) -> Option<bytes::Bytes> {
    let start = std::time::Instant::now();
    metrics::record_frame(frame_kind(data), "inbound", data.len());

    let reply = match conn.handle_frame(data) {
        Ok(reply) => reply,
        Err(e) => {
            metrics::record_decode_error();
            warn!(
                connection = %conn.connection_id(),
                document = %conn.document_id(),
                error = %e,
                "Dropping frame"
            );
            None
        }
    };

    metrics::record_latency(start.elapsed().as_secs_f64());
    reply
}

/// Metrics label for a frame.
fn frame_kind(frame: &[u8]) -> &'static str {
    match codec::peek_type(frame) {
        Ok(MessageType::Sync) => "sync",
        Ok(MessageType::Awareness) => "awareness",
        Ok(MessageType::QueryAwareness) => "query_awareness",
        Ok(MessageType::Extension(EXTENSION_DOCUMENT_DELETED)) => "deleted",
        Ok(MessageType::Extension(_)) => "extension",
        Err(_) => "invalid",
    }
}
