//! HTTP surface: one push stream per `GET`, plus small read-only endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tether_core::WatchDescriptor;
use tether_kubehub::{ResourceKind, ResourceWatch};
use tracing::debug;

use crate::Bridge;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    /// Frames buffered per client before writes wait on the socket.
    pub queue_cap: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/watches", get(list_watches))
        .route("/api/watch", get(watch_any))
        .route("/api/watch/{kind}", get(watch_kind))
        .with_state(state)
}

async fn healthz() -> &'static str { "ok" }

async fn list_watches(State(state): State<AppState>) -> Json<serde_json::Value> {
    let keys: Vec<String> = state.bridge.registry().active_keys().iter().map(ToString::to_string).collect();
    Json(json!({ "count": keys.len(), "keys": keys }))
}

/// Arbitrary collection: `?group=&version=&resource=&namespace=...`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnyWatchQuery {
    #[serde(default)]
    group: Option<String>,
    version: Option<String>,
    resource: Option<String>,
    namespace: Option<String>,
    label_selector: Option<String>,
    field_selector: Option<String>,
    resource_version: Option<String>,
    timeout_seconds: Option<u32>,
}

async fn watch_any(State(state): State<AppState>, Query(q): Query<AnyWatchQuery>) -> Response {
    let (Some(version), Some(resource)) = (non_empty(q.version), non_empty(q.resource)) else {
        return bad_request("version and resource are required");
    };
    let descriptor = WatchDescriptor {
        api_group: q.group.unwrap_or_default(),
        api_version: version,
        resource,
        namespace: non_empty(q.namespace),
        label_selector: non_empty(q.label_selector),
        field_selector: non_empty(q.field_selector),
        resource_version: non_empty(q.resource_version),
        timeout_seconds: q.timeout_seconds,
    };
    stream_response(&state, descriptor).await
}

async fn watch_kind(State(state): State<AppState>, Path(kind): Path<String>, Query(mut q): Query<ResourceWatch>) -> Response {
    let kind = match kind.parse::<ResourceKind>() {
        Ok(k) => k,
        Err(e) => return bad_request(&e.to_string()),
    };
    q.namespace = non_empty(q.namespace);
    if q.namespace.is_none() {
        return bad_request("namespace is required");
    }
    stream_response(&state, kind.descriptor(&q)).await
}

async fn stream_response(state: &AppState, descriptor: WatchDescriptor) -> Response {
    if let Err(e) = descriptor.validate() {
        return bad_request(&e.to_string());
    }
    let (transport, body) = tether_stream::channel(state.queue_cap);
    let abort = transport.disconnect_signal();
    let key = descriptor.key();
    let session = state.bridge.open(Arc::new(transport), abort, vec![descriptor]).await;
    debug!(session = %session.id(), %key, "push stream response");
    Sse::new(body.map(Ok::<_, Infallible>)).into_response()
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
