use crate::error::ProxyError;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, Version};
use sluice_cache::CacheCounters;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_WORKER_PID: HeaderName = HeaderName::from_static("x-worker-pid");
pub const X_WORKER_ID: HeaderName = HeaderName::from_static("x-worker-id");
pub const X_CACHE_SIZE: HeaderName = HeaderName::from_static("x-cache-size");
pub const X_CACHE_HITS: HeaderName = HeaderName::from_static("x-cache-hits");
pub const X_CACHE_MISSES: HeaderName = HeaderName::from_static("x-cache-misses");

/// How a proxied response relates to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from cache.
    Hit,
    /// Fetched upstream and stored.
    Miss,
    /// Fetched upstream, not cacheable.
    Bypass,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "HIT",
            CacheOutcome::Miss => "MISS",
            CacheOutcome::Bypass => "BYPASS",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

/// Which process served a response. `id` is only set under the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub pid: u32,
    pub id: Option<u32>,
}

impl WorkerIdentity {
    pub fn current(id: Option<u32>) -> Self {
        Self {
            pid: std::process::id(),
            id,
        }
    }
}

/// Resolve the upstream target for a request path. The returned string is
/// both the URL to forward to and the cache key; it is never normalized.
///
/// - `/http://host/p?q` and `/https://host/p?q` are used verbatim.
/// - `/host.tld/p`, `/localhost/p` and `/host:port/p` become `http://host...`.
/// - anything else is ambiguous.
pub fn derive_cache_key(path_and_query: &str) -> Result<String, ProxyError> {
    let clean = path_and_query.strip_prefix('/').unwrap_or(path_and_query);

    if clean.starts_with("http://") || clean.starts_with("https://") {
        return Ok(clean.to_string());
    }

    let first_segment = clean.split('/').next().unwrap_or("");
    if !clean.is_empty() && looks_like_host(first_segment) {
        return Ok(format!("http://{clean}"));
    }

    Err(ProxyError::AmbiguousTarget)
}

/// An HTTP/1.x request line naming a full URL (`GET http://host/path HTTP/1.1`).
/// HTTP/2 requests always carry `:authority`, so they never count.
pub fn is_absolute_form(uri: &Uri, version: Version) -> bool {
    version <= Version::HTTP_11 && uri.scheme().is_some() && uri.authority().is_some()
}

/// Same as [`derive_cache_key`], but absolute-form targets are taken as-is.
pub fn resolve_target(uri: &Uri, version: Version) -> Result<String, ProxyError> {
    if is_absolute_form(uri, version) {
        return Ok(uri.to_string());
    }
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    derive_cache_key(path_and_query)
}

/// A dot, the word `localhost`, or `:<digits>` anywhere in the segment.
fn looks_like_host(segment: &str) -> bool {
    if segment.contains('.') || segment.contains("localhost") {
        return true;
    }
    segment
        .match_indices(':')
        .any(|(i, _)| segment[i + 1..].starts_with(|c: char| c.is_ascii_digit()))
}

/// Only plain 200 responses are stored or served from cache.
pub fn is_cacheable(status: StatusCode) -> bool {
    status == StatusCode::OK
}

/// Attach cache and worker diagnostics. Other headers are left alone.
pub fn annotate(
    headers: &mut HeaderMap,
    outcome: CacheOutcome,
    counters: CacheCounters,
    worker: WorkerIdentity,
) {
    headers.insert(X_CACHE, HeaderValue::from_static(outcome.as_str()));
    headers.insert(X_WORKER_PID, HeaderValue::from(worker.pid));
    if let Some(id) = worker.id {
        headers.insert(X_WORKER_ID, HeaderValue::from(id));
    }
    headers.insert(X_CACHE_SIZE, HeaderValue::from(counters.size));
    headers.insert(X_CACHE_HITS, HeaderValue::from(counters.hits));
    headers.insert(X_CACHE_MISSES, HeaderValue::from(counters.misses));
}
