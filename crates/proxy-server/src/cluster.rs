//! Multi-process mode.
//!
//! The supervisor re-executes the current binary once per worker. Workers
//! share the listen port through `SO_REUSEPORT` and each owns an independent
//! cache; nothing is synchronized between them, so clears and deletes only
//! affect the worker that happens to serve the request.
//!
//! Workers report `busy`/`available` transitions as JSON lines on stdout. The
//! supervisor aggregates them and serves `/api/workers-status`.

use crate::config::Config;
use crate::proxy::AppState;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Available,
    Busy,
    Exited,
}

/// One line of the worker → supervisor side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: WorkerState,
    pub requests: u64,
    /// Unix milliseconds of the most recent request start.
    pub last_request: u64,
    pub pid: u32,
}

/// Supervisor-side view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub id: u32,
    pub status: WorkerState,
    pub requests: u64,
    pub pid: u32,
    pub last_request: Option<u64>,
}

impl WorkerRecord {
    fn new(id: u32, pid: u32) -> Self {
        Self {
            id,
            status: WorkerState::Available,
            requests: 0,
            pid,
            last_request: None,
        }
    }

    fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        self.requests = update.requests;
        self.pid = update.pid;
        self.last_request = Some(update.last_request);
    }
}

pub type Registry = Arc<Mutex<BTreeMap<u32, WorkerRecord>>>;

/// Emits status updates from a worker. Disabled outside the supervisor.
pub struct StatusReporter {
    tx: Option<mpsc::UnboundedSender<StatusUpdate>>,
    requests: AtomicU64,
    last_request: AtomicU64,
}

impl StatusReporter {
    pub fn disabled() -> Self {
        Self {
            tx: None,
            requests: AtomicU64::new(0),
            last_request: AtomicU64::new(0),
        }
    }

    /// Write updates to stdout from a background task. Must be called from
    /// within the runtime.
    pub fn stdout() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_status_lines(rx, tokio::io::stdout()));
        Self {
            tx: Some(tx),
            ..Self::disabled()
        }
    }

    #[cfg(test)]
    fn channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            tx: Some(tx),
            ..Self::disabled()
        };
        (reporter, rx)
    }

    pub fn begin(&self) {
        let requests = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_request.store(now_ms(), Ordering::Relaxed);
        self.send(WorkerState::Busy, requests);
    }

    pub fn finish(&self) {
        self.send(WorkerState::Available, self.requests.load(Ordering::Relaxed));
    }

    fn send(&self, status: WorkerState, requests: u64) {
        let Some(tx) = &self.tx else {
            return;
        };
        let _ = tx.send(StatusUpdate {
            status,
            requests,
            last_request: self.last_request.load(Ordering::Relaxed),
            pid: std::process::id(),
        });
    }
}

async fn write_status_lines<W>(mut rx: mpsc::UnboundedReceiver<StatusUpdate>, mut out: W)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(update) = rx.recv().await {
        let mut line = match serde_json::to_vec(&update) {
            Ok(l) => l,
            Err(_) => continue,
        };
        line.push(b'\n');
        if out.write_all(&line).await.is_err() || out.flush().await.is_err() {
            break; // supervisor went away
        }
    }
}

/// Middleware reporting busy/available around every request.
pub async fn track_status(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    state.reporter.begin();
    let response = next.run(req).await;
    state.reporter.finish();
    response
}

/// Bind the listen socket. Workers set `SO_REUSEPORT` so they can share it.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    {
        if reuse_port {
            socket.set_reuseport(true)?;
        }
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Spawn `workers` worker processes and serve the status endpoint until
/// shutdown. Workers are killed when the supervisor exits; exited workers
/// are not respawned.
pub async fn run_supervisor(
    config: &Config,
    config_path: &Path,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let workers = config.cluster.workers;
    let exe = std::env::current_exe()?;
    let registry: Registry = Arc::new(Mutex::new(BTreeMap::new()));

    tracing::info!(workers, listen = %config.server.listen_addr, "supervisor forking workers");

    for id in 1..=workers as u32 {
        let mut child = Command::new(&exe)
            .arg("--config")
            .arg(config_path)
            .arg("--worker-id")
            .arg(id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or(0);
        registry.lock().insert(id, WorkerRecord::new(id, pid));
        tracing::info!(worker = id, pid, "worker spawned");

        let stdout = child.stdout.take();
        tokio::spawn(watch_worker(id, child, stdout, Arc::clone(&registry)));
    }

    let status_router = status_router(Arc::clone(&registry));
    let status_listener = match config.server.status_addr.parse::<SocketAddr>() {
        Ok(addr) => bind_listener(addr, false),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidInput, e)),
    };

    match status_listener {
        Ok(listener) => {
            tracing::info!(addr = %config.server.status_addr, "worker status server listening");
            axum::serve(listener, status_router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await?;
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                addr = %config.server.status_addr,
                "cannot bind status port, skipping worker status server"
            );
            shutdown.cancelled().await;
        }
    }

    Ok(())
}

async fn watch_worker(id: u32, mut child: Child, stdout: Option<ChildStdout>, registry: Registry) {
    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<StatusUpdate>(&line) {
                    Ok(update) => {
                        if let Some(record) = registry.lock().get_mut(&id) {
                            record.apply(&update);
                        }
                    }
                    Err(e) => tracing::debug!(worker = id, error = %e, "ignoring malformed status line"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = id, error = %e, "worker status channel failed");
                    break;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => tracing::warn!(worker = id, %status, "worker exited"),
        Err(e) => tracing::error!(worker = id, error = %e, "failed to wait on worker"),
    }
    if let Some(record) = registry.lock().get_mut(&id) {
        record.status = WorkerState::Exited;
    }
}

pub fn status_router(registry: Registry) -> Router {
    Router::new()
        .route("/api/workers-status", get(workers_status_handler))
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "Not found"})),
            )
        })
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn workers_status_handler(State(registry): State<Registry>) -> impl IntoResponse {
    let workers: Vec<WorkerRecord> = registry.lock().values().cloned().collect();
    Json(serde_json::json!({ "workers": workers }))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
