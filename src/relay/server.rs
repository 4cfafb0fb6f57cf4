use std::{future::Future, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderValue,
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::hub::RelayHub;

#[derive(Clone)]
pub struct RelayState {
    pub hub: Arc<RelayHub>,
    pub peer_queue_capacity: usize,
}

impl RelayState {
    pub fn new(peer_queue_capacity: usize) -> Self {
        Self {
            hub: Arc::new(RelayHub::new()),
            peer_queue_capacity: peer_queue_capacity.max(1),
        }
    }
}

pub fn relay_router(state: RelayState, allowed_origin: Option<HeaderValue>) -> Router {
    let cors = match allowed_origin {
        Some(origin) => CorsLayer::new().allow_origin(origin),
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods(Any)
    .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(handle_websocket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<F>(
    listener: TcpListener,
    state: RelayState,
    allowed_origin: Option<HeaderValue>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, relay_router(state, allowed_origin))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.peer_queue_capacity);

    let peer = state.hub.register(tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let hub = state.hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    hub.dispatch(peer, &text).await;
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!("Peer {} read error: {}", peer, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unregister(peer).await;
}
