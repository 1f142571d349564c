use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// The error taxonomy for the proxy core, per the propagation table in the spec's
/// error handling design: auth/routing/throttle/upstream-status are terminal for a
/// request, storage is fatal at startup but degrades at request time, cache errors
/// are always swallowed by the caller.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("missing or invalid proxy access token")]
    Auth,

    #[error("unknown domain alias '{0}'")]
    Routing(String),

    #[error("domain '{domain}' is throttled, retry after {retry_after_secs}s")]
    Throttle { domain: String, retry_after_secs: u64 },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from the pooled SQL store. Fatal at startup; degrade-and-report at
/// request time per spec §7.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open database at {path}: {source}")]
    Open { path: String, source: rusqlite::Error },

    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("exhausted retries acquiring a write lock")]
    RetriesExhausted,
}

/// Always-recoverable cache-layer errors (serialization, compression).
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to compress payload: {0}")]
    Compression(#[from] std::io::Error),

    #[error("failed to serialize headers: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store access failed: {0}")]
    Store(#[from] StorageError),
}

/// Errors raised while loading and validating `ApiBuddyConfig`. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid domain alias '{0}': aliases must be non-empty and contain no '/'")]
    InvalidAlias(String),

    #[error("duplicate domain alias '{0}'")]
    DuplicateAlias(String),

    #[error("invalid upstream URL for alias '{alias}': {source}")]
    InvalidUpstream { alias: String, source: url::ParseError },

    #[error("ttl_seconds for '{0}' must be greater than zero")]
    InvalidTtl(String),

    #[error("invalid server address '{0}'")]
    InvalidServerAddress(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ProxyError::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            ProxyError::Routing(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ProxyError::Throttle { retry_after_secs, .. } => {
                let retry_after = *retry_after_secs;
                let response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", retry_after.to_string())],
                    self.to_string(),
                );
                return response.into_response();
            }
            ProxyError::UpstreamTransport(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            ProxyError::UpstreamStatus(status) => (*status, self.to_string()),
            ProxyError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ProxyError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            ProxyError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        (status, body).into_response()
    }
}
