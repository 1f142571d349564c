//! A local caching, rate-limiting proxy for read-mostly reference APIs.
//!
//! The six core components — [`store`], [`cache`], [`throttle`], [`security`],
//! [`pipeline`], [`metrics`] — are bundled behind [`ApiBuddy`], the facade
//! external collaborators (CLIs, admin tooling, tests) drive.

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod security;
pub mod store;
pub mod throttle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Uri};
use tokio::net::TcpListener;
use tracing::info;

use crate::cache::CacheEngine;
use crate::config::ApiBuddyConfig;
use crate::error::ProxyError;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{build_router, AppState};
use crate::security::SecurityGate;
use crate::store::Store;
use crate::throttle::ThrottleManager;

const POOL_SIZE: u32 = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// External-collaborator facade: `start`, `stop`, `get_secure_key`,
/// `get_metrics`, `clear_cache`, `validate_request` (§6).
pub struct ApiBuddy {
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: tokio::sync::Notify,
}

impl ApiBuddy {
    pub fn new(config: ApiBuddyConfig) -> Result<Self, ProxyError> {
        let store = Store::open(&config.cache.database_path, POOL_SIZE)?;
        let cache = CacheEngine::new(
            store,
            config.cache.max_cache_response_size,
            config.cache.max_cache_entries,
        );
        let throttle = ThrottleManager::new(config.throttling.progressive_max_delay);
        let security =
            SecurityGate::new(config.security.require_secure_key, config.security.secure_key.clone());
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client configuration is valid");

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|_| {
                ProxyError::Config(crate::error::ConfigError::InvalidServerAddress(format!(
                    "{}:{}",
                    config.server.host, config.server.port
                )))
            })?;

        let state = Arc::new(AppState {
            domains: config.domain_registry(),
            cache,
            throttle,
            security,
            metrics: Arc::new(metrics::MetricsSink::new()),
            http_client,
            default_requests_per_hour: config.throttling.default_requests_per_hour,
        });

        Ok(Self { state, addr, shutdown: tokio::sync::Notify::new() })
    }

    /// Returns the generated or configured token once, if security is enabled.
    pub fn get_secure_key(&self) -> Option<String> {
        self.state.security.secure_key().map(|s| s.to_string())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.state.metrics.snapshot()
    }

    pub async fn clear_cache(&self, domain_alias: Option<&str>) -> Result<usize, ProxyError> {
        Ok(self.state.cache.clear(domain_alias).await?)
    }

    /// Runs the Security Gate extraction+validation path without dispatching a
    /// request, for external health-check / admin tooling use.
    pub fn validate_request(
        &self,
        path: &str,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> (bool, Option<String>) {
        let uri: Uri = match query {
            Some(q) => format!("{path}?{q}").parse().unwrap_or_else(|_| path.parse().unwrap()),
            None => path.parse().unwrap_or_else(|_| "/".parse().unwrap()),
        };
        let first_segment = path.trim_start_matches('/').split('/').next().unwrap_or("");
        let candidate = SecurityGate::extract_candidate(headers, &uri, first_segment);
        if self.state.security.validate(candidate.as_deref()) {
            (true, None)
        } else {
            (false, Some("missing or invalid proxy access token".to_string()))
        }
    }

    /// Binds and serves until `stop()` is called or the process receives a
    /// shutdown signal. `blocking` is accepted for interface compatibility
    /// with the external-collaborator surface in §6; this implementation
    /// always awaits the serve future to completion.
    pub async fn start(&self, blocking: bool) -> std::io::Result<()> {
        let _ = blocking;
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "api-buddy listening");
        let router = build_router(self.state.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(self.wait_for_shutdown())
            .await
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    async fn wait_for_shutdown(&self) {
        self.shutdown.notified().await;
    }
}
