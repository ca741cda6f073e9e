use crate::error::ProxyError;
use crate::proxy::AppState;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sluice_cache::CacheSnapshot;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: Option<String>,
}

impl KeyQuery {
    fn require(self) -> Result<String, ProxyError> {
        self.key
            .filter(|k| !k.is_empty())
            .ok_or(ProxyError::MissingKey)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem {
    pub key: String,
    pub value: String,
    pub size: usize,
    pub last_accessed: u64,
}

/// GET /api/cache-status
pub async fn cache_status(State(state): State<Arc<AppState>>) -> Json<CacheSnapshot> {
    Json(state.cache.lock().stats())
}

/// POST /api/clear-cache
pub async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.cache.lock().clear();
    tracing::info!(worker_pid = state.worker.pid, "cache cleared");
    Json(json!({"success": true, "message": "Cache cleared"}))
}

/// GET /api/cache-item?key=...
///
/// Inspection goes through `peek` rather than `get`: looking at an item does
/// not promote it and is not counted as a hit or miss, so the dashboard
/// never skews the hit ratio it reports.
pub async fn get_cache_item(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<CacheItem>, ProxyError> {
    let key = query.require()?;
    let cache = state.cache.lock();
    let entry = cache
        .peek(&key)
        .ok_or_else(|| ProxyError::KeyNotFound(key.clone()))?;

    Ok(Json(CacheItem {
        key: entry.key.clone(),
        value: String::from_utf8_lossy(&entry.value).into_owned(),
        size: entry.value.len(),
        last_accessed: entry.last_accessed_ms(),
    }))
}

/// DELETE /api/cache-item?key=...
pub async fn delete_cache_item(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<Value>, ProxyError> {
    let key = query.require()?;
    if state.cache.lock().remove_key(&key).is_none() {
        return Err(ProxyError::KeyNotFound(key));
    }
    tracing::info!(key = %key, "cache item deleted");
    Ok(Json(json!({"success": true, "message": "Item deleted"})))
}

/// Minimal built-in landing page.
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    let worker = match state.worker.id {
        Some(id) => format!("worker {id} (pid {})", state.worker.pid),
        None => format!("pid {}", state.worker.pid),
    };
    Html(format!(
        "<html>\
         <head><title>Proxy Dashboard</title></head>\
         <body>\
         <h1>Proxy Server Dashboard</h1>\
         <p>Dashboard is running on {worker}</p>\
         <p><a href=\"/api/cache-status\">View Cache Status</a></p>\
         </body>\
         </html>"
    ))
}

pub async fn favicon() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(CONTENT_TYPE, "image/x-icon")])
}
