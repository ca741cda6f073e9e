use crate::proxy::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use sluice_cache::CacheSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Background task: every `interval`, refresh the Prometheus gauges and, if
/// anyone is listening, broadcast a cache snapshot to WebSocket clients.
pub async fn snapshot_broadcaster(
    state: Arc<AppState>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        record_gauges(&state);

        if state.telemetry.receiver_count() == 0 {
            continue;
        }
        let snapshot = state.cache.lock().stats();
        // Ignore send errors (no subscribers)
        let _ = state.telemetry.send(Arc::new(snapshot));
    }
}

fn record_gauges(state: &AppState) {
    let stats = state.cache.lock().cache_stats();
    metrics::gauge!("sluice_cache_size").set(stats.current_size as f64);
    metrics::gauge!("sluice_cache_capacity").set(stats.capacity as f64);
    metrics::gauge!("sluice_cache_evictions").set(stats.evictions as f64);
}

/// WebSocket upgrade handler for /ws/cache.
pub async fn ws_cache_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_client(socket, state))
}

async fn handle_ws_client(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.telemetry.subscribe();

    // Send the current state right away instead of waiting for the next tick.
    let initial = Arc::new(state.cache.lock().stats());
    if send_snapshot(&mut socket, &initial).await.is_err() {
        return;
    }

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                if send_snapshot(&mut socket, &snapshot).await.is_err() {
                    break; // Client disconnected
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn send_snapshot(socket: &mut WebSocket, snapshot: &CacheSnapshot) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(snapshot) {
        Ok(j) => j,
        Err(_) => return Ok(()),
    };
    socket.send(Message::Text(json.into())).await
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
