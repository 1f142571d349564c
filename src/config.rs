//! Layered configuration surface: a TOML file validated once at start into the
//! immutable runtime types the core consumes.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::DomainMapping;
use crate::error::ConfigError;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_ttl() -> u64 {
    3600
}

fn default_max_response_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_entries() -> u64 {
    100_000
}

fn default_requests_per_hour() -> u32 {
    1000
}

fn default_progressive_max_delay() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub require_secure_key: bool,
    pub secure_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_max_response_size")]
    pub max_cache_response_size: usize,
    #[serde(default = "default_max_entries")]
    pub max_cache_entries: u64,
}

fn default_database_path() -> String {
    "api-buddy.sqlite3".to_string()
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            default_ttl_seconds: default_ttl(),
            max_cache_response_size: default_max_response_size(),
            max_cache_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottlingSection {
    #[serde(default = "default_requests_per_hour")]
    pub default_requests_per_hour: u32,
    #[serde(default = "default_progressive_max_delay")]
    pub progressive_max_delay: u64,
    #[serde(default)]
    pub domain_limits: HashMap<String, u32>,
}

impl Default for ThrottlingSection {
    fn default() -> Self {
        Self {
            default_requests_per_hour: default_requests_per_hour(),
            progressive_max_delay: default_progressive_max_delay(),
            domain_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainMappingSection {
    pub upstream: String,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// Root configuration structure, deserialized once from a TOML file at start.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiBuddyConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub throttling: ThrottlingSection,
    #[serde(default)]
    pub domain_mappings: HashMap<String, DomainMappingSection>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ApiBuddyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: ApiBuddyConfig = toml::from_str(&raw)?;
        if let Ok(key) = std::env::var("API_BUDDY_SECURE_KEY") {
            config.security.secure_key = Some(key);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for (alias, mapping) in &self.domain_mappings {
            if alias.is_empty() || alias.contains('/') {
                return Err(ConfigError::InvalidAlias(alias.clone()));
            }
            if !seen.insert(alias) {
                return Err(ConfigError::DuplicateAlias(alias.clone()));
            }
            url::Url::parse(&mapping.upstream).map_err(|source| ConfigError::InvalidUpstream {
                alias: alias.clone(),
                source,
            })?;
            if let Some(ttl) = mapping.ttl_seconds {
                if ttl == 0 {
                    return Err(ConfigError::InvalidTtl(alias.clone()));
                }
            }
        }
        Ok(())
    }

    /// Converts the validated sections into the immutable runtime domain registry.
    pub fn domain_registry(&self) -> HashMap<String, DomainMapping> {
        self.domain_mappings
            .iter()
            .map(|(alias, section)| {
                (
                    alias.clone(),
                    DomainMapping {
                        alias: alias.clone(),
                        upstream_base_url: section.upstream.clone(),
                        ttl_seconds: section.ttl_seconds,
                        rate_limit_per_hour: self.throttling.domain_limits.get(alias).copied(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_sections() {
        let toml = r#"
            [domain_mappings.cn]
            upstream = "https://api.example.org"
        "#;
        let config: ApiBuddyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.cache.default_ttl_seconds, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_alias_with_slash() {
        let toml = r#"
            [domain_mappings."bad/alias"]
            upstream = "https://api.example.org"
        "#;
        let config: ApiBuddyConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAlias(_))));
    }

    #[test]
    fn rejects_unparseable_upstream() {
        let toml = r#"
            [domain_mappings.cn]
            upstream = "not a url"
        "#;
        let config: ApiBuddyConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUpstream { .. })));
    }

    #[test]
    fn rejects_zero_ttl() {
        let toml = r#"
            [domain_mappings.cn]
            upstream = "https://api.example.org"
            ttl_seconds = 0
        "#;
        let config: ApiBuddyConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTtl(_))));
    }
}
