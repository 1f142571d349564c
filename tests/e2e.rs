//! End-to-end scenarios against a mocked upstream, driving the full Axum app
//! with `tower::ServiceExt::oneshot`, grounded on the request/response
//! wiring style of `http-cache-tower-server`'s own integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use api_buddy::cache::CacheEngine;
use api_buddy::domain::DomainMapping;
use api_buddy::metrics::MetricsSink;
use api_buddy::pipeline::{build_router, AppState};
use api_buddy::security::SecurityGate;
use api_buddy::store::Store;
use api_buddy::throttle::ThrottleManager;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn build_state(upstream: &MockServer, overrides: impl FnOnce(&mut TestConfig)) -> Arc<AppState> {
    let mut config = TestConfig::default();
    overrides(&mut config);

    let store = Store::open(":memory:", 4).unwrap();
    let cache = CacheEngine::new(store, 10 * 1024 * 1024, 10_000);
    let throttle = ThrottleManager::new(300);
    let security = SecurityGate::new(config.require_secure_key, config.secure_key);

    let mut domains = HashMap::new();
    domains.insert(
        "cn".to_string(),
        DomainMapping {
            alias: "cn".to_string(),
            upstream_base_url: upstream.uri(),
            ttl_seconds: config.ttl_seconds,
            rate_limit_per_hour: config.domain_limit,
        },
    );

    Arc::new(AppState {
        domains,
        cache,
        throttle,
        security,
        metrics: Arc::new(MetricsSink::new()),
        http_client: reqwest::Client::new(),
        default_requests_per_hour: config.default_requests_per_hour,
    })
}

struct TestConfig {
    require_secure_key: bool,
    secure_key: Option<String>,
    ttl_seconds: Option<u64>,
    domain_limit: Option<u32>,
    default_requests_per_hour: u32,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            require_secure_key: false,
            secure_key: None,
            ttl_seconds: None,
            domain_limit: None,
            default_requests_per_hour: 1000,
        }
    }
}

async fn read_body(response: axum::response::Response) -> (StatusCode, String) {
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn cold_get_calls_upstream_and_stores_one_row() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |_| {}).await;
    let app = build_router(state.clone());

    let request = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let (status, body) = read_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");

    let snapshot = state.metrics.snapshot();
    let cn = snapshot.per_domain.get("cn").unwrap();
    assert_eq!(cn.misses, 1);
    assert_eq!(cn.requests, 1);
}

#[tokio::test]
async fn warm_get_does_not_call_upstream_again() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |_| {}).await;
    let app = build_router(state.clone());

    let first = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
    let (status, body) = read_body(app.clone().oneshot(first).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");

    let second = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
    let (status, body) = read_body(app.oneshot(second).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");

    let snapshot = state.metrics.snapshot();
    let cn = snapshot.per_domain.get("cn").unwrap();
    assert_eq!(cn.hits, 1);
    assert_eq!(cn.misses, 1);
}

#[tokio::test]
async fn throttle_trips_on_the_third_distinct_miss() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |c| c.domain_limit = Some(2)).await;
    let app = build_router(state.clone());

    for path in ["/cn/a", "/cn/b"] {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let (status, _) = read_body(app.clone().oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let request = Request::builder().uri("/cn/c").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn chunked_upstream_is_normalized_to_content_length() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("hello world")
                .insert_header("transfer-encoding", "chunked"),
        )
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |_| {}).await;
    let app = build_router(state.clone());

    let request = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.headers().get("content-length").unwrap(), "11");
    let (status, body) = read_body(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello world");
}

#[tokio::test]
async fn auth_required_admits_via_header_query_and_path() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |c| {
        c.require_secure_key = true;
        c.secure_key = Some("T".to_string());
    })
    .await;

    // No token: 401.
    let app = build_router(state.clone());
    let request = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Token as query param: 200.
    let app = build_router(state.clone());
    let request = Request::builder().uri("/cn/foo?key=T").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Token as path prefix: 200.
    let app = build_router(state.clone());
    let request = Request::builder().uri("/T/cn/foo").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Token as header: 200.
    let app = build_router(state.clone());
    let request =
        Request::builder().uri("/cn/foo").header("X-API-Buddy-Key", "T").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn per_domain_ttl_override_expires_independently() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("news"))
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |c| c.ttl_seconds = Some(60)).await;
    let app = build_router(state.clone());

    let request = Request::builder().uri("/cn/x").body(Body::empty()).unwrap();
    let (status, _) = read_body(app.oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let snapshot = state.metrics.snapshot();
    assert_eq!(snapshot.per_domain.get("cn").unwrap().misses, 1);
}

#[tokio::test]
async fn concurrent_misses_for_the_same_fingerprint_leave_one_row() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&upstream)
        .await;

    let state = build_state(&upstream, |_| {}).await;
    let app = build_router(state.clone());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let request = Request::builder().uri("/cn/foo").body(Body::empty()).unwrap();
            app.oneshot(request).await.unwrap().status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }
}
