use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{greeting::Aloha, metrics::Metrics, origin, ws, Backend, GATEWAY_VERSION};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) backend: Arc<Backend>,
    pub(crate) metrics: Metrics,
}

/// A running gateway listener. Dropping it stops the listener without waiting.
pub struct ServerHandle {
    addr: SocketAddr,
    metrics: Metrics,
    stop: CancellationToken,
    serving: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Stop accepting connections and wait for the listener to wind down. Relays already
    /// running are ended by `Backend::cleanup`.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        let serving = &mut self.serving;
        let _ = serving.await;
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.serving.is_finished() {
            self.stop.cancel();
            self.serving.abort();
        }
    }
}

/// Bind `listen_addr` and serve the gateway. `backend` must already be set up.
pub async fn start_server(
    listen_addr: SocketAddr,
    backend: Arc<Backend>,
) -> std::io::Result<ServerHandle> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    let addr = listener.local_addr()?;

    let metrics = Metrics::new();
    let app = build_app(AppState {
        backend,
        metrics: metrics.clone(),
    });

    let stop = CancellationToken::new();
    let serving = tokio::spawn({
        let stop = stop.clone();
        async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
            if let Err(err) = served {
                tracing::error!("gateway listener failed: {err}");
            }
        }
    });

    Ok(ServerHandle {
        addr,
        metrics,
        stop,
        serving,
    })
}

fn build_app(state: AppState) -> Router {
    // The simulator connects to the bare host URL, so every other path is the gateway.
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .fallback(gateway_ws_handler)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render_prometheus();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn gateway_ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // A missing header reads as "", which never parses as an allowed origin.
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !origin::is_allowed(origin) {
        state.metrics.admission_denied();
        tracing::warn!(%remote, "Origin not allowed: {origin:?}");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "expected a WebSocket upgrade").into_response();
    };
    ws.on_upgrade(move |socket| handle_gateway_ws(socket, remote, state))
}

async fn handle_gateway_ws(mut socket: WebSocket, remote: SocketAddr, state: AppState) {
    tracing::info!(%remote, "client connected");

    let greeting = match Aloha::new(GATEWAY_VERSION).to_text() {
        Ok(greeting) => greeting,
        Err(err) => {
            tracing::error!(%remote, "failed to encode greeting: {err}");
            return;
        }
    };
    if let Err(err) = socket.send(Message::Text(greeting)).await {
        tracing::warn!(%remote, "failed to send greeting: {err}");
        return;
    }

    state.metrics.session_opened();
    let (source, sink) = ws::split(socket, remote);
    let result = state.backend.handle_connection(source, sink, remote).await;
    state.metrics.session_closed(result.is_err());
}
