//! WebSocket and health endpoints.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use super::RealtimeBridge;
use crate::error::{GatewayError, Result};
use crate::lane::LaneHandle;
use crate::link::LinkState;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    bridge: Arc<RealtimeBridge>,
    lanes: Arc<[LaneHandle]>,
}

/// Health of one field link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkHealth {
    pub endpoint: String,
    pub state: String,
    pub connected: bool,
    pub devices: Vec<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok" when every link is connected, "degraded" otherwise.
    pub status: &'static str,
    pub links: Vec<LinkHealth>,
    pub subscribers: usize,
    pub dropped_updates: u64,
}

impl HealthReport {
    pub fn collect(bridge: &RealtimeBridge, lanes: &[LaneHandle]) -> Self {
        let links: Vec<LinkHealth> = lanes
            .iter()
            .map(|lane| {
                let state = lane.link_state();
                LinkHealth {
                    endpoint: lane.endpoint().to_string(),
                    connected: state == LinkState::Connected,
                    state: state.to_string(),
                    devices: lane.devices().iter().map(|d| d.name.clone()).collect(),
                }
            })
            .collect();

        Self {
            status: if links.iter().all(|l| l.connected) {
                "ok"
            } else {
                "degraded"
            },
            links,
            subscribers: bridge.registry().len(),
            dropped_updates: bridge.dropped(),
        }
    }
}

/// Create the HTTP router.
pub fn create_router(bridge: Arc<RealtimeBridge>, lanes: Vec<LaneHandle>, ws_path: &str) -> Router {
    let state = AppState {
        bridge,
        lanes: lanes.into(),
    };

    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = HealthReport::collect(&state.bridge, &state.lanes);
    (StatusCode::OK, Json(report)).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.bridge))
}

/// Upper bound for a single frame to reach a subscriber's socket.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one subscriber until either side goes away.
///
/// The session ends as soon as the writer or the reader finishes; both socket
/// halves are dropped then, so an evicted subscriber never keeps its socket.
async fn handle_socket(socket: WebSocket, bridge: Arc<RealtimeBridge>) {
    let (handle, mut outbound) = bridge.registry().register(bridge.subscriber_buffer());
    let id = handle.id();
    // The registry owns the subscriber from here on.
    drop(handle);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let sent = tokio::time::timeout(
                SEND_TIMEOUT,
                ws_tx.send(Message::Text(message.to_string())),
            )
            .await;
            if !matches!(sent, Ok(Ok(()))) {
                debug!(subscriber = id, "WebSocket send failed, closing");
                return;
            }
        }
        // Evicted or shutting down.
        let _ = tokio::time::timeout(SEND_TIMEOUT, ws_tx.send(Message::Close(None))).await;
    });

    // Inbound text is ignored; reading only detects the close.
    let reader = async {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => debug!(subscriber = id, "Writer finished"),
        _ = reader => debug!(subscriber = id, "Peer closed"),
    }

    bridge.registry().remove(id);
    writer.abort();
    info!(subscriber = id, "Subscriber disconnected");
}

/// WebSocket server for live updates.
pub struct RealtimeServer {
    bridge: Arc<RealtimeBridge>,
    lanes: Vec<LaneHandle>,
    listen_addr: SocketAddr,
    ws_path: String,
}

impl RealtimeServer {
    pub fn new(
        bridge: Arc<RealtimeBridge>,
        lanes: Vec<LaneHandle>,
        listen_addr: SocketAddr,
        ws_path: String,
    ) -> Self {
        Self {
            bridge,
            lanes,
            listen_addr,
            ws_path,
        }
    }

    /// Bind the listener ahead of [`RealtimeServer::run`], so a taken port
    /// fails startup.
    pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })
    }

    /// Serve until the shutdown signal is received.
    pub async fn run(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let router = create_router(self.bridge, self.lanes, &self.ws_path);

        info!(
            addr = %self.listen_addr,
            path = %self.ws_path,
            "Realtime server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("Realtime server shutting down");
            })
            .await?;

        info!("Realtime server stopped");
        Ok(())
    }
}
