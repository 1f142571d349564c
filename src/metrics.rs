//! Append-only event recorder plus per-domain counter aggregation, grounded on
//! the teacher's `CacheMetrics` (`AtomicU64` counters, `hit_rate()`) from
//! `http-cache-tower-server/src/lib.rs`, extended with the bounded ring and
//! per-domain keying the spec requires.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestReceived,
    AuthPass,
    AuthFail,
    CacheHit,
    CacheMiss,
    Throttled,
    UpstreamOk,
    UpstreamError,
    CacheStore,
}

#[derive(Debug, Clone)]
pub struct MetricsEvent {
    pub ts: u64,
    pub kind: EventKind,
    pub domain_alias: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct DomainCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    throttled: AtomicU64,
    upstream_errors: AtomicU64,
    bytes_served: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct DomainSnapshot {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub throttled: u64,
    pub upstream_errors: u64,
    pub bytes_served: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub events: Vec<MetricsEvent>,
    pub per_domain: HashMap<String, DomainSnapshot>,
}

pub struct MetricsSink {
    ring: Mutex<VecDeque<MetricsEvent>>,
    ring_capacity: usize,
    per_domain: dashmap::DashMap<String, DomainCounters>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            per_domain: dashmap::DashMap::new(),
        }
    }

    pub fn record(
        &self,
        kind: EventKind,
        domain_alias: Option<&str>,
        latency_ms: Option<u64>,
        bytes: u64,
    ) {
        if let Some(domain) = domain_alias {
            let counters = self.per_domain.entry(domain.to_string()).or_default();
            match kind {
                EventKind::RequestReceived => counters.requests.fetch_add(1, Ordering::Relaxed),
                EventKind::CacheHit => counters.hits.fetch_add(1, Ordering::Relaxed),
                EventKind::CacheMiss => counters.misses.fetch_add(1, Ordering::Relaxed),
                EventKind::Throttled => counters.throttled.fetch_add(1, Ordering::Relaxed),
                EventKind::UpstreamError => counters.upstream_errors.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
            if bytes > 0 {
                counters.bytes_served.fetch_add(bytes, Ordering::Relaxed);
            }
        }

        let event = MetricsEvent {
            ts: now_unix(),
            kind,
            domain_alias: domain_alias.map(|s| s.to_string()),
            latency_ms,
        };
        let mut ring = self.ring.lock().expect("metrics ring poisoned");
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let events = self.ring.lock().expect("metrics ring poisoned").iter().cloned().collect();
        let per_domain = self
            .per_domain
            .iter()
            .map(|entry| {
                let counters = entry.value();
                (
                    entry.key().clone(),
                    DomainSnapshot {
                        requests: counters.requests.load(Ordering::Relaxed),
                        hits: counters.hits.load(Ordering::Relaxed),
                        misses: counters.misses.load(Ordering::Relaxed),
                        throttled: counters.throttled.load(Ordering::Relaxed),
                        upstream_errors: counters.upstream_errors.load(Ordering::Relaxed),
                        bytes_served: counters.bytes_served.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        MetricsSnapshot { events, per_domain }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let sink = MetricsSink::with_capacity(4);
        for _ in 0..10 {
            sink.record(EventKind::RequestReceived, Some("cn"), None, 0);
        }
        assert_eq!(sink.snapshot().events.len(), 4);
    }

    #[test]
    fn per_domain_counters_accumulate() {
        let sink = MetricsSink::new();
        sink.record(EventKind::CacheHit, Some("cn"), None, 128);
        sink.record(EventKind::CacheMiss, Some("cn"), None, 256);
        let snapshot = sink.snapshot();
        let cn = snapshot.per_domain.get("cn").unwrap();
        assert_eq!(cn.hits, 1);
        assert_eq!(cn.misses, 1);
        assert_eq!(cn.bytes_served, 384);
    }
}
