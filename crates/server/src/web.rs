use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Query, State};
use axum::http::header::{CONTENT_LENGTH, REFERER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use wavecast_protocol::{Event, OriginConfig, Source};
use wavecast_tracker::Tracker;

/// Shared application state.
pub struct AppState {
    pub config: OriginConfig,
    pub tracker: Arc<Tracker>,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
pub async fn security_headers(
    request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new(&state.config.server.media_root);
    let cors = build_cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/icecast/listener", get(icecast_listener_callback))
        .fallback_service(serve_dir)
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            media_pipeline,
        ))
        .layer(cors)
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "dropped_events": state.tracker.dropped_count(),
        "flush_errors": state.tracker.flush_error_count(),
    }))
}

/// Icecast auth callback for listener connect/disconnect. Icecast is
/// configured to GET this URL once per listener event; the `client` id is
/// the only stable handle Icecast gives us, so identity resolution happens
/// inside the tracker (`SessionStore::resolve_icecast`), not here.
#[derive(Debug, Deserialize)]
struct IcecastCallback {
    #[serde(default)]
    action: String,
    client: i64,
    mount: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    agent: String,
}

async fn icecast_listener_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IcecastCallback>,
) -> StatusCode {
    tracing::debug!(action = %params.action, client = params.client, mount = %params.mount, "icecast callback");

    // §6: any of mount/ip/agent empty, or client zero, and the handler
    // rejects outright rather than submitting a degraded event.
    if params.mount.is_empty() || params.ip.is_empty() || params.agent.is_empty() || params.client == 0 {
        return StatusCode::BAD_REQUEST;
    }

    let event = Event {
        time: Utc::now(),
        path: String::new(),
        ip: params.ip,
        user_agent: params.agent,
        referer: String::new(),
        sid: String::new(),
        uid: String::new(),
        icecast_id: Some(params.client),
        mount: params.mount,
        chunk_size: 0,
        source: Source::Icecast,
    };
    state.tracker.submit(event);
    StatusCode::OK
}

/// Single middleware wrapping the static media tree: records an ingest
/// event for every segment delivery, and rewrites `sid`/`uid` query params
/// into every URI line of a served playlist so the player's next segment
/// request carries the same identity.
async fn media_pipeline(
    State(state): State<Arc<AppState>>,
    Extension(peer_addr): Extension<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let path = uri.path().to_string();
    let params = parse_query(uri.query().unwrap_or(""));

    let response = next.run(req).await;
    if !response.status().is_success() {
        return response;
    }

    if is_segment_path(&path) {
        let chunk_size = content_length(&response);
        let event = Event {
            time: Utc::now(),
            path: path.clone(),
            ip: remote_ip(&headers, peer_addr),
            user_agent: header_str(&headers, USER_AGENT),
            referer: header_str(&headers, REFERER),
            sid: params.get("sid").cloned().unwrap_or_default(),
            uid: params.get("uid").cloned().unwrap_or_default(),
            icecast_id: None,
            mount: mount_from_path(&path),
            chunk_size,
            source: Source::Hls,
        };
        state.tracker.submit(event);
        return response;
    }

    if path.ends_with(".m3u8") {
        return rewrite_playlist(response, &params).await;
    }

    response
}

async fn rewrite_playlist(response: Response, params: &HashMap<String, String>) -> Response {
    let sid = params
        .get("sid")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let uid = params
        .get("uid")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(_) => return (parts.status, parts.headers, Body::empty()).into_response(),
    };
    let Ok(text) = std::str::from_utf8(&bytes) else {
        return (parts.status, parts.headers, Body::from(bytes)).into_response();
    };

    let rewritten = text
        .lines()
        .map(|line| {
            if line.starts_with('#') || line.trim().is_empty() {
                line.to_string()
            } else {
                let sep = if line.contains('?') { '&' } else { '?' };
                format!("{line}{sep}sid={sid}&uid={uid}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut headers = parts.headers;
    headers.remove(CONTENT_LENGTH);
    (parts.status, headers, Body::from(rewritten)).into_response()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn is_segment_path(path: &str) -> bool {
    const SEGMENT_EXTENSIONS: &[&str] = &[".ts", ".aac", ".mp3", ".m4s", ".ac3", ".eac3"];
    SEGMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn mount_from_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

fn content_length(response: &Response) -> u64 {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn header_str(headers: &HeaderMap, name: axum::http::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn remote_ip(headers: &HeaderMap, peer_addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer_addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_from_path_takes_first_segment() {
        assert_eq!(mount_from_path("/radio1/mp3_hifi_1_1_1.ts"), "radio1");
        assert_eq!(mount_from_path("/radio1"), "radio1");
        assert_eq!(mount_from_path(""), "");
    }

    #[test]
    fn is_segment_path_matches_known_extensions_only() {
        assert!(is_segment_path("/r/mp3_hifi_1_1_1.ts"));
        assert!(is_segment_path("/r/aac_lofi_1_1_1.aac"));
        assert!(!is_segment_path("/r/playlist.m3u8"));
        assert!(!is_segment_path("/favicon.ico"));
    }

    #[test]
    fn parse_query_splits_key_value_pairs() {
        let params = parse_query("sid=abc&uid=def");
        assert_eq!(params.get("sid").map(String::as_str), Some("abc"));
        assert_eq!(params.get("uid").map(String::as_str), Some("def"));
    }

    #[test]
    fn parse_query_on_empty_string_is_empty() {
        assert!(parse_query("").is_empty());
    }

    async fn disabled_state() -> Arc<AppState> {
        let tracker = Tracker::connect(wavecast_protocol::TrackerConfig {
            connection_string: None,
            ..Default::default()
        })
        .await
        .unwrap();
        Arc::new(AppState {
            config: toml::from_str("").unwrap(),
            tracker: Arc::new(tracker),
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn icecast_callback_rejects_missing_fields_with_400() {
        use tower::ServiceExt;

        let state = disabled_state().await;
        let peer_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let app = build_router(state).layer(axum::Extension(peer_addr));

        let req = axum::http::Request::builder()
            .uri("/icecast/listener?action=listener_add&client=7&mount=m")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn icecast_callback_rejects_zero_client_id() {
        use tower::ServiceExt;

        let state = disabled_state().await;
        let peer_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let app = build_router(state).layer(axum::Extension(peer_addr));

        let req = axum::http::Request::builder()
            .uri("/icecast/listener?action=listener_add&client=0&mount=m&ip=10.0.0.1&agent=foo")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn icecast_callback_accepts_complete_params() {
        use tower::ServiceExt;

        let state = disabled_state().await;
        let peer_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let app = build_router(state).layer(axum::Extension(peer_addr));

        let req = axum::http::Request::builder()
            .uri("/icecast/listener?action=listener_add&client=7&mount=m&ip=10.0.0.1&agent=foo")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
