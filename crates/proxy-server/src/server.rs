use crate::api;
use crate::cluster::{self, StatusReporter};
use crate::config::Config;
use crate::policy::{self, WorkerIdentity};
use crate::proxy::{proxy_handler, AppState};
use crate::telemetry::{metrics_handler, snapshot_broadcaster, ws_cache_handler};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Management routes first; everything else is treated as a proxy target.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::dashboard))
        .route("/index.html", get(api::dashboard))
        .route("/dashboard", get(api::dashboard))
        .route("/favicon.ico", get(api::favicon))
        .route("/api/cache-status", get(api::cache_status))
        .route("/api/clear-cache", post(api::clear_cache))
        .route(
            "/api/cache-item",
            get(api::get_cache_item).delete(api::delete_cache_item),
        )
        .route("/ws/cache", get(ws_cache_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            absolute_form_to_proxy,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cluster::track_status,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Routing only looks at the path, so `GET http://host/ HTTP/1.1` would
/// otherwise land on the dashboard. Absolute-form requests are always proxy
/// requests.
async fn absolute_form_to_proxy(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if policy::is_absolute_form(req.uri(), req.version()) {
        return proxy_handler(State(state), req).await.into_response();
    }
    next.run(req).await
}

/// Run one serving process until `shutdown` fires. `worker_id` is set when
/// this process was spawned by the supervisor.
pub async fn run_worker(
    config: Config,
    worker_id: Option<u32>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let prometheus = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    let reporter = if worker_id.is_some() {
        StatusReporter::stdout()
    } else {
        StatusReporter::disabled()
    };

    let state = Arc::new(
        AppState::new(
            config.cache.capacity,
            WorkerIdentity::current(worker_id),
            config.upstream_timeout(),
        )
        .with_reporter(reporter)
        .with_prometheus(prometheus),
    );

    tokio::spawn(snapshot_broadcaster(
        Arc::clone(&state),
        config.telemetry_interval(),
        shutdown.clone(),
    ));

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let listener = cluster::bind_listener(addr, worker_id.is_some())?;

    tracing::info!(
        listen = %addr,
        capacity = config.cache.capacity,
        upstream_timeout_ms = config.upstream.timeout_ms,
        worker_id = ?worker_id,
        pid = state.worker.pid,
        "sluice proxy listening"
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!(worker_id = ?worker_id, "sluice proxy shut down");
    Ok(())
}
