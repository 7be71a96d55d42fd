use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use parley_core::backend::ChatBackend;
use parley_relay::{RelayConfig, TurnRunner};
use parley_store::Database;

use crate::client::{self, ConnectionId, ConnectionRegistry};
use crate::event_bridge;
use crate::handlers::HandlerState;
use crate::orchestrator::RelayOrchestrator;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub event_capacity: usize,
    pub cleanup_interval: Duration,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
            event_capacity: 1024,
            cleanup_interval: Duration::from_secs(60),
            relay: RelayConfig::default(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub registry: Arc<ConnectionRegistry>,
    pub message_tx: mpsc::Sender<(ConnectionId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle keeping its tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    backend: Arc<dyn ChatBackend>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));
    let (event_tx, _) = broadcast::channel(config.event_capacity);

    let bridge_handle = event_bridge::create_bridge(Arc::clone(&registry), event_tx.subscribe());
    let cleanup_handle = client::start_cleanup_task(Arc::clone(&registry), config.cleanup_interval);

    let runner = TurnRunner::new(backend, db.clone(), config.relay, event_tx.clone());
    let orchestrator = Arc::new(RelayOrchestrator::new(runner, event_tx));

    let handler_state = Arc::new(HandlerState::new(db, Arc::clone(&registry), orchestrator));

    let (message_tx, message_rx) = mpsc::channel::<(ConnectionId, String)>(1024);
    let rpc_handle = tokio::spawn(process_rpc_messages(
        message_rx,
        Arc::clone(&handler_state),
        Arc::clone(&registry),
    ));

    let app_state = AppState {
        handler_state,
        registry,
        message_tx,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "parley server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _rpc: rpc_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()`. Dropping it does not stop the server;
/// the tasks run for the process lifetime.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection for its lifetime, then cancel any turns
/// it initiated so a disconnect stops its in-flight streams.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "client connected");

    client::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.registry),
        state.message_tx.clone(),
    )
    .await;

    let cancelled = state
        .handler_state
        .orchestrator
        .cancel_for_connection(&connection_id);
    tracing::info!(connection_id = %connection_id, cancelled, "client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
    }))
}

/// Decode inbound WebSocket text frames as RPC requests and answer on the
/// caller's outbound queue.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ConnectionId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ConnectionRegistry>,
) {
    while let Some((connection_id, raw)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&connection_id, json);
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response = crate::handlers::dispatch(
            &state,
            &connection_id,
            &request.method,
            &params,
            request.id,
        )
        .await;

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&connection_id, json);
        }
    }
}
