use crate::cluster::StatusReporter;
use crate::error::ProxyError;
use crate::policy::{self, CacheOutcome, WorkerIdentity};
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use sluice_cache::{CacheManager, CacheSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Upstream client for both `http://` and `https://` targets. Server
/// certificates are verified against the bundled webpki roots.
pub fn upstream_client() -> HttpClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Shared state passed to all handlers of one worker process.
///
/// The cache lock is only ever held for a single synchronous cache call,
/// never across an await, so every cache operation runs to completion
/// before the next one starts.
pub struct AppState {
    pub cache: Mutex<CacheManager>,
    pub client: HttpClient,
    pub worker: WorkerIdentity,
    pub upstream_timeout: Duration,
    pub reporter: StatusReporter,
    pub telemetry: broadcast::Sender<Arc<CacheSnapshot>>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(capacity: usize, worker: WorkerIdentity, upstream_timeout: Duration) -> Self {
        let (telemetry, _) = broadcast::channel(16);
        Self {
            cache: Mutex::new(CacheManager::new(capacity)),
            client: upstream_client(),
            worker,
            upstream_timeout,
            reporter: StatusReporter::disabled(),
            telemetry,
            prometheus: None,
        }
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_prometheus(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.prometheus = handle;
        self
    }
}

/// Fully buffered upstream response.
struct Upstream {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Resolve the target, serve from cache on a hit, otherwise forward, buffer,
/// store if cacheable and respond.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let start = Instant::now();

    let target = policy::resolve_target(req.uri(), req.version()).inspect_err(|_| {
        tracing::debug!(uri = %req.uri(), "no forwardable target");
    })?;

    let hit = {
        let mut cache = state.cache.lock();
        cache.get(&target).map(|body| (body, cache.counters()))
    };

    if let Some((body, counters)) = hit {
        metrics::counter!("sluice_cache_requests_total", "outcome" => CacheOutcome::Hit.label())
            .increment(1);
        tracing::debug!(
            key = %target,
            latency_us = start.elapsed().as_micros(),
            "cache HIT"
        );

        let mut response = Response::new(Body::from(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        policy::annotate(
            response.headers_mut(),
            CacheOutcome::Hit,
            counters,
            state.worker,
        );
        return Ok(response);
    }

    let upstream = forward(&state, req, &target).await.inspect_err(|e| {
        metrics::counter!("sluice_upstream_errors_total").increment(1);
        tracing::error!(error = %e, upstream = %target, "upstream request failed");
    })?;

    let outcome = if policy::is_cacheable(upstream.status) {
        CacheOutcome::Miss
    } else {
        CacheOutcome::Bypass
    };

    // The body is complete at this point; a dropped client never reaches here.
    let counters = {
        let mut cache = state.cache.lock();
        if outcome == CacheOutcome::Miss {
            cache.put(target.clone(), upstream.body.clone());
        }
        cache.counters()
    };

    metrics::counter!("sluice_cache_requests_total", "outcome" => outcome.label()).increment(1);
    metrics::gauge!("sluice_cache_size").set(counters.size as f64);
    tracing::debug!(
        key = %target,
        status = upstream.status.as_u16(),
        cached = outcome == CacheOutcome::Miss,
        latency_us = start.elapsed().as_micros(),
        "cache MISS → upstream"
    );

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (key, value) in upstream.headers.iter() {
        // Skip hop-by-hop headers
        if key == TRANSFER_ENCODING || key == CONNECTION {
            continue;
        }
        headers.append(key.clone(), value.clone());
    }
    policy::annotate(headers, outcome, counters, state.worker);

    Ok(response)
}

/// Send the client's request to `target` and buffer the whole response.
async fn forward(
    state: &AppState,
    req: Request<Body>,
    target: &str,
) -> Result<Upstream, ProxyError> {
    let uri: Uri = target.parse().map_err(|_| ProxyError::AmbiguousTarget)?;
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or(ProxyError::AmbiguousTarget)?;

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method).uri(uri);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in parts.headers.iter() {
            // Upstream bodies are stored as-is, so ask for them uncompressed.
            if name == HOST || name == ACCEPT_ENCODING {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Ok(host) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, host);
        }
    }
    let upstream_req = builder
        .body(body)
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;

    let started = Instant::now();
    let fetch = async {
        let resp = state
            .client
            .request(upstream_req)
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?;
        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))?
            .to_bytes();
        Ok(Upstream {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };

    let result = match tokio::time::timeout(state.upstream_timeout, fetch).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamUnreachable(format!(
            "timed out after {}ms",
            state.upstream_timeout.as_millis()
        ))),
    };
    metrics::histogram!("sluice_upstream_duration_seconds").record(started.elapsed().as_secs_f64());
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::policy::{X_CACHE, X_CACHE_HITS, X_CACHE_MISSES, X_CACHE_SIZE, X_WORKER_ID, X_WORKER_PID};
    use crate::server::build_router;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    pub(crate) fn test_state(capacity: usize) -> Arc<AppState> {
        Arc::new(AppState::new(
            capacity,
            WorkerIdentity::current(None),
            Duration::from_secs(2),
        ))
    }

    /// Local upstream on an ephemeral port. `/ok` counts how often it is hit.
    async fn spawn_upstream(ok_calls: Arc<AtomicUsize>) -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { "upstream root" }))
            .route(
                "/ok",
                get(move || {
                    let calls = Arc::clone(&ok_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "hello"
                    }
                }),
            )
            .route(
                "/json",
                get(|| async { ([(CONTENT_TYPE, "application/json")], r#"{"a":1}"#) }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            )
            .route(
                "/host",
                get(|headers: HeaderMap| async move {
                    let host = headers
                        .get(HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let encoding = headers.contains_key(ACCEPT_ENCODING);
                    format!("{host} {encoding}")
                }),
            )
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(resp: Response<Body>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&calls)).await;
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));
        let uri = format!("/http://{addr}/ok");

        let first = app.clone().oneshot(request(&uri)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[&X_CACHE], "MISS");
        assert_eq!(first.headers()[&X_CACHE_SIZE], "1");
        assert_eq!(first.headers()[&X_CACHE_MISSES], "1");
        assert_eq!(
            first.headers()[&X_WORKER_PID],
            std::process::id().to_string().as_str()
        );
        assert!(first.headers().get(&X_WORKER_ID).is_none());
        assert_eq!(body_string(first).await, "hello");

        let second = app.clone().oneshot(request(&uri)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[&X_CACHE], "HIT");
        assert_eq!(second.headers()[&X_CACHE_HITS], "1");
        assert_eq!(second.headers()[CONTENT_TYPE], "text/html");
        assert_eq!(body_string(second).await, "hello");

        assert_eq!(calls.load(Ordering::SeqCst), 1, "hit must not reach upstream");
        let cache = state.cache.lock();
        assert_eq!(cache.total_requests(), 2);
        assert!(cache.peek(&format!("http://{addr}/ok")).is_some());
    }

    #[tokio::test]
    async fn upstream_headers_are_passed_through() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let app = build_router(test_state(8));

        let resp = app
            .oneshot(request(&format!("/http://{addr}/json")))
            .await
            .unwrap();
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(resp.headers()[&X_CACHE], "MISS");
        assert_eq!(body_string(resp).await, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn non_200_bypasses_cache() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));
        let uri = format!("/http://{addr}/missing");

        for _ in 0..2 {
            let resp = app.clone().oneshot(request(&uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            assert_eq!(resp.headers()[&X_CACHE], "BYPASS");
            assert_eq!(body_string(resp).await, "nope");
        }

        let mut cache = state.cache.lock();
        assert_eq!(cache.counters().size, 0);
        assert!(cache.get(&format!("http://{addr}/missing")).is_none());
    }

    #[tokio::test]
    async fn bare_host_form_is_forwarded_with_rewritten_host() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));

        let req = Request::builder()
            .uri(format!("/{addr}/host"))
            .header(HOST, "proxy.local")
            .header(ACCEPT_ENCODING, "gzip")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, format!("{addr} false"));
        assert!(state
            .cache
            .lock()
            .peek(&format!("http://{addr}/host"))
            .is_some());
    }

    #[tokio::test]
    async fn ambiguous_target_is_bad_request() {
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));

        let resp = app.oneshot(request("/justapath")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(resp).await.contains("provide a full URL"));
        assert_eq!(state.cache.lock().total_requests(), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let state = test_state(8);
        let app = build_router(Arc::clone(&state));
        let resp = app
            .oneshot(request(&format!("/http://127.0.0.1:{port}/x")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(state.cache.lock().counters().size, 0);
    }

    /// Accepts one connection and reports the first byte the client sent.
    async fn spawn_first_byte_listener() -> (SocketAddr, tokio::sync::oneshot::Receiver<u8>) {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            if socket.read_exact(&mut first).await.is_ok() {
                let _ = tx.send(first[0]);
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn https_target_is_forwarded_over_tls() {
        let (addr, first_byte) = spawn_first_byte_listener().await;
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));

        let resp = app
            .oneshot(request(&format!("/https://{addr}/secure")))
            .await
            .unwrap();

        // 0x16 opens a TLS handshake record (ClientHello).
        assert_eq!(first_byte.await.unwrap(), 0x16);
        // The listener is not a TLS server, so the handshake fails.
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let cache = state.cache.lock();
        assert_eq!(cache.counters().misses, 1);
        assert_eq!(cache.counters().size, 0);
    }

    #[tokio::test]
    async fn client_disconnect_leaves_no_entry() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = test_state(8);
        let key = format!("http://{addr}/slow");

        // Dropping the handler future mid-flight is what a client disconnect does.
        let in_flight = proxy_handler(State(Arc::clone(&state)), request(&format!("/{key}")));
        let dropped = tokio::time::timeout(Duration::from_millis(200), in_flight).await;
        assert!(dropped.is_err(), "upstream should still be sleeping");

        let cache = state.cache.lock();
        assert_eq!(cache.counters().size, 0);
        assert!(cache.peek(&key).is_none());
    }

    #[tokio::test]
    async fn absolute_form_reaches_proxy_even_on_management_paths() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = test_state(8);
        let app = build_router(Arc::clone(&state));

        let resp = app
            .oneshot(request(&format!("http://{addr}/")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[&X_CACHE], "MISS");
        assert_eq!(body_string(resp).await, "upstream root");

        let cache = state.cache.lock();
        assert_eq!(cache.total_requests(), 1);
        assert!(cache.peek(&format!("http://{addr}/")).is_some());
    }

    #[tokio::test]
    async fn slow_upstream_times_out_without_caching() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = Arc::new(AppState::new(
            8,
            WorkerIdentity::current(Some(3)),
            Duration::from_millis(200),
        ));
        let app = build_router(Arc::clone(&state));

        let resp = app
            .oneshot(request(&format!("/http://{addr}/slow")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(state.cache.lock().counters().size, 0);
    }

    #[tokio::test]
    async fn worker_id_header_when_clustered() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = Arc::new(AppState::new(
            8,
            WorkerIdentity::current(Some(3)),
            Duration::from_secs(2),
        ));
        let app = build_router(state);

        let resp = app
            .oneshot(request(&format!("/http://{addr}/ok")))
            .await
            .unwrap();
        assert_eq!(resp.headers()[&X_WORKER_ID], "3");
    }

    #[tokio::test]
    async fn eviction_through_proxy() {
        let addr = spawn_upstream(Arc::new(AtomicUsize::new(0))).await;
        let state = test_state(1);
        let app = build_router(Arc::clone(&state));

        app.clone()
            .oneshot(request(&format!("/http://{addr}/ok")))
            .await
            .unwrap();
        app.clone()
            .oneshot(request(&format!("/http://{addr}/json")))
            .await
            .unwrap();

        let snapshot = state.cache.lock().stats();
        assert_eq!(snapshot.size, 1);
        assert_eq!(snapshot.keys[0].key, format!("http://{addr}/json"));
    }
}
