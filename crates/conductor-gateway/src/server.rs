use crate::bus::{NotificationBus, DEFAULT_HEARTBEAT};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use conductor_orchestrator::Orchestrator;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Seconds between heartbeat snapshots per connection. `0` disables them.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT.as_secs()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
        }
    }
}

impl GatewayConfig {
    /// Heartbeat interval as a duration.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Shared application state.
pub struct AppState {
    /// Notification bus shared by every socket.
    pub bus: Arc<NotificationBus>,
}

/// The observer-facing gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router around an orchestrator and start relaying its events.
    pub fn build(orchestrator: Arc<Orchestrator>, config: &GatewayConfig) -> Router {
        let events = orchestrator.events().clone();
        let bus = Arc::new(NotificationBus::new(orchestrator, config.heartbeat()));
        bus.start(&events);
        Self::with_bus(bus)
    }

    /// Build the router around an existing bus. The caller owns the relay.
    pub fn with_bus(bus: Arc<NotificationBus>) -> Router {
        let state = Arc::new(AppState { bus });
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "conductor",
        "connections": state.bus.connections().connection_count().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (connection_id, mut rx) = state.bus.connect().await;
    info!(connection_id = %connection_id, "WebSocket connected");

    // Task: forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Task: route inbound frames through the bus
    let bus = state.bus.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => bus.handle_text(connection_id, text.as_str()).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    first_to_finish(send_task, recv_task).await;

    state.bus.disconnect(connection_id).await;
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

/// Wait for either socket task to end, then abort the other.
async fn first_to_finish(mut send_task: JoinHandle<()>, mut recv_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conductor_core::Repository;
    use conductor_orchestrator::OrchestratorConfig;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_connections() {
        let orch = Arc::new(Orchestrator::new(
            Repository::in_memory(),
            OrchestratorConfig::default(),
        ));
        let app = GatewayServer::build(orch, &GatewayConfig::default());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_finished_socket_task_aborts_the_other() {
        let (guard, released) = tokio::sync::oneshot::channel::<()>();
        let receiving = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        let sending = tokio::spawn(async {});

        first_to_finish(sending, receiving).await;
        // Aborting drops the guard, closing the channel.
        let closed = tokio::time::timeout(Duration::from_secs(5), released).await;
        assert!(closed.unwrap().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.heartbeat(), Duration::from_secs(30));
    }
}
