//! A1: the axum HTTP surface — `/v1/messages`, `/stats`, `/healthz`.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::error::Result;
use crate::proxy::ProxyState;

const TENANT_HEADER: &str = "x-instance-id";
const DEFAULT_TENANT: &str = "unknown";

/// Headers stripped before forwarding a caller's request upstream: the
/// proxy's own credential replaces whatever the caller sent, and the
/// hop-by-hop/body-shape headers are reqwest's to manage, not ours to copy.
const STRIPPED_HEADERS: [&str; 5] =
    ["authorization", "x-api-key", "host", "content-length", "content-type"];

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/stats", get(stats))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn messages(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response> {
    let tenant_id = tenant_id_from_headers(&headers);
    let correlation_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("proxy_request", %correlation_id, %tenant_id);
    let upstream_headers = forwarded_headers(&headers);

    let response = state
        .handle_request(&tenant_id, body, &upstream_headers)
        .instrument(span)
        .await?;
    Ok(Json(response).into_response())
}

/// Build the header set to send upstream: everything the caller sent minus
/// credentials and hop-by-hop headers reqwest manages itself, so
/// `anthropic-version` and any other caller header pass through unchanged.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !STRIPPED_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

async fn stats(State(state): State<ProxyState>) -> impl IntoResponse {
    Json(state.snapshot())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

fn tenant_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_TENANT)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_tenant_id_from_headers_present() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("tenant-a"));
        assert_eq!(tenant_id_from_headers(&headers), "tenant-a");
    }

    #[test]
    fn test_tenant_id_from_headers_missing_falls_back_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(tenant_id_from_headers(&headers), DEFAULT_TENANT);
    }

    #[test]
    fn test_forwarded_headers_drops_credentials_and_keeps_version() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-secret"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let forwarded = forwarded_headers(&headers);
        assert!(!forwarded.contains_key("authorization"));
        assert!(!forwarded.contains_key("x-api-key"));
        assert!(!forwarded.contains_key("content-type"));
        assert_eq!(forwarded.get("anthropic-version").unwrap(), "2023-06-01");
    }
}
