//! The configured alias → upstream mapping. Immutable after start.

use std::collections::HashMap;

/// A configured alias: `{ alias, upstream_base_url, ttl_seconds?, rate_limit_per_hour? }`.
/// Aliases must be non-empty, unique, case-sensitive, and contain no `/` — enforced by
/// [`crate::config::ApiBuddyConfig::validate`] before a registry is ever built.
#[derive(Debug, Clone)]
pub struct DomainMapping {
    pub alias: String,
    pub upstream_base_url: String,
    pub ttl_seconds: Option<u64>,
    pub rate_limit_per_hour: Option<u32>,
}

pub type DomainRegistry = HashMap<String, DomainMapping>;
