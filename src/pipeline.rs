//! HTTP server front-end. A single catch-all route runs the ordered decision
//! pipeline directly as its handler, grounded on the teacher's
//! `http-cache-tower-server` `axum_advanced` example for router/state
//! composition (`AppState`, metrics/admin routes alongside the cached route).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info, warn};

use crate::cache::{generate_fingerprint, CacheEngine};
use crate::domain::DomainRegistry;
use crate::error::ProxyError;
use crate::metrics::{EventKind, MetricsSink};
use crate::security::SecurityGate;
use crate::throttle::ThrottleManager;

/// Request headers that are never forwarded to the upstream or back to the
/// client — standard hop-by-hop headers plus the proxy's own auth header.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-api-buddy-key",
];

pub struct AppState {
    pub domains: DomainRegistry,
    pub cache: CacheEngine,
    pub throttle: ThrottleManager,
    pub security: SecurityGate,
    pub metrics: Arc<MetricsSink>,
    pub http_client: reqwest::Client,
    pub default_requests_per_hour: u32,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    axum::Json(serde_json::json!({
        "events": snapshot.events.len(),
        "per_domain": snapshot.per_domain.iter().map(|(domain, counters)| {
            (domain.clone(), serde_json::json!({
                "requests": counters.requests,
                "hits": counters.hits,
                "misses": counters.misses,
                "throttled": counters.throttled,
                "upstream_errors": counters.upstream_errors,
                "bytes_served": counters.bytes_served,
            }))
        }).collect::<serde_json::Map<_, _>>(),
    }))
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metrics.record(EventKind::RequestReceived, None, None, 0);

    match run_pipeline(&state, method, uri, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run_pipeline(
    state: &AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let start = Instant::now();
    let path = uri.path().trim_start_matches('/');
    let mut segments: Vec<&str> = path.split('/').collect();
    let first_segment = segments.first().copied().unwrap_or("");

    // Step 2: security gate.
    let candidate = SecurityGate::extract_candidate(&headers, &uri, first_segment);
    let token_in_path = state.security.enabled()
        && state.security.secure_key().map(|k| k == first_segment).unwrap_or(false);
    if !state.security.validate(candidate.as_deref()) {
        warn!("auth_fail");
        state.metrics.record(EventKind::AuthFail, None, None, 0);
        return Err(ProxyError::Auth);
    }
    state.metrics.record(EventKind::AuthPass, None, None, 0);

    // Strip the token path segment only when security is enabled and it was consumed from the path.
    if token_in_path {
        segments.remove(0);
    }

    // Step 3: resolve the alias.
    let alias = segments.first().copied().unwrap_or("");
    let domain = state
        .domains
        .get(alias)
        .ok_or_else(|| ProxyError::Routing(alias.to_string()))?;
    let rest = segments.get(1..).unwrap_or(&[]).join("/");

    // Re-attribute the request now that the domain is known, so the
    // per-domain `requests` counter (§4.6) actually accumulates.
    state.metrics.record(EventKind::RequestReceived, Some(alias), None, 0);

    // Step 4: build the upstream URL, stripping the `key` query param consumed by the gate.
    let upstream_url = build_upstream_url(&domain.upstream_base_url, &rest, uri.query());

    // Step 5: fingerprint.
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let fingerprint = generate_fingerprint(method.as_str(), &upstream_url, &body, &content_type);

    // Step 6: cache lookup. A lookup error degrades to a miss rather than
    // failing the request (§7: CacheError/StorageError are swallowed at
    // request time, not propagated).
    match state.cache.lookup(&fingerprint).await {
        Ok(Some(cached)) => {
            debug!(domain_alias = %alias, %fingerprint, "cache_hit");
            state.metrics.record(EventKind::CacheHit, Some(alias), None, cached.payload.len() as u64);
            return Ok(build_client_response(cached.status_code, &cached.headers, cached.payload));
        }
        Ok(None) => {
            debug!(domain_alias = %alias, %fingerprint, "cache_miss");
            state.metrics.record(EventKind::CacheMiss, Some(alias), None, 0);
        }
        Err(err) => {
            warn!(domain_alias = %alias, %fingerprint, error = %err, "cache lookup failed, degrading to pass-through");
            state.metrics.record(EventKind::CacheMiss, Some(alias), None, 0);
        }
    }

    // Step 7: throttle check.
    let limit = domain.rate_limit_per_hour.unwrap_or(state.default_requests_per_hour);
    if !state.throttle.should_admit(alias, limit) {
        state.throttle.record_violation(alias);
        let retry_after = state.throttle.retry_after_secs(alias);
        warn!(domain_alias = %alias, retry_after, "throttled");
        state.metrics.record(EventKind::Throttled, Some(alias), None, 0);
        return Err(ProxyError::Throttle { domain: alias.to_string(), retry_after_secs: retry_after });
    }
    state.throttle.record_admission(alias);

    // Step 8: forward to upstream.
    let mut forward_headers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        forward_headers.insert(name.clone(), value.clone());
    }
    let mut upstream_req = state.http_client.request(method, &upstream_url).headers(forward_headers);
    if !body.is_empty() {
        upstream_req = upstream_req.body(body.clone());
    }

    let upstream_response = match upstream_req.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(domain_alias = %alias, error = %err, "upstream transport error");
            state.metrics.record(EventKind::UpstreamError, Some(alias), None, 0);
            return Err(ProxyError::UpstreamTransport(err));
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    let response_body = upstream_response.bytes().await?;

    if status.as_u16() == 429 {
        state.throttle.record_violation(alias);
    }

    // Step 9: normalize headers (chunked transfer-encoding is collapsed by `.bytes()` above;
    // we simply never forward the Transfer-Encoding header and always emit Content-Length).
    let mut forwarded_headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response_headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            forwarded_headers.insert(name.to_string(), value_str.to_string());
        }
    }
    forwarded_headers.insert("content-length".to_string(), response_body.len().to_string());

    // Step 10: cache store when cacheable.
    let ttl = domain.ttl_seconds.unwrap_or(default_ttl_for(state));
    let cacheable = is_cacheable(status.as_u16(), &forwarded_headers);
    if cacheable {
        let stored = state
            .cache
            .store(&fingerprint, alias, status.as_u16(), &forwarded_headers, &response_body, ttl)
            .await
            .unwrap_or(false);
        if stored {
            state.metrics.record(EventKind::CacheStore, Some(alias), None, 0);
        }
    }

    let latency_ms = start.elapsed().as_millis() as u64;
    if status.is_success() || status.is_redirection() {
        state.metrics.record(EventKind::UpstreamOk, Some(alias), Some(latency_ms), response_body.len() as u64);
    } else {
        state.metrics.record(EventKind::UpstreamError, Some(alias), Some(latency_ms), 0);
    }
    info!(domain_alias = %alias, status = status.as_u16(), latency_ms, "upstream_ok");

    Ok(build_client_response(status.as_u16(), &forwarded_headers, response_body.to_vec()))
}

fn default_ttl_for(_state: &AppState) -> u64 {
    3600
}

fn is_cacheable(status: u16, headers: &HashMap<String, String>) -> bool {
    if (200..=299).contains(&status) {
        return true;
    }
    if (300..=308).contains(&status) {
        return headers.get("location").map(|loc| loc.len() <= 2048).unwrap_or(false);
    }
    false
}

fn build_upstream_url(base: &str, rest: &str, query: Option<&str>) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    if !rest.is_empty() {
        url.push('/');
        url.push_str(rest);
    }
    if let Some(query) = query {
        let filtered: Vec<&str> =
            query.split('&').filter(|pair| !pair.starts_with("key=")).collect();
        if !filtered.is_empty() {
            url.push('?');
            url.push_str(&filtered.join("&"));
        }
    }
    url
}

fn build_client_response(status: u16, headers: &HashMap<String, String>, body: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str()))
        {
            builder = builder.header(name, value);
        }
    }
    builder.body(axum::body::Body::from(body)).expect("response headers are sanitized upstream")
}
