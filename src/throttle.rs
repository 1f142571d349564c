//! Per-domain sliding-window rate accounting and progressive back-off, grounded
//! on the "cache-aware, only consulted on cache miss" framing of the teacher's
//! `CacheAwareRateLimiter` trait (`http-cache/src/rate_limiting.rs`). The hourly
//! window here is hand-rolled rather than delegated to `governor`, because the
//! spec's `state(domain)` snapshot must expose the raw `request_timestamps`
//! (§3), which a keyed governor limiter has no API to return.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const ONE_HOUR: Duration = Duration::from_secs(3600);
const BASE_DELAY_SECS: u64 = 2;
const DECAY_INTERVAL: Duration = Duration::from_secs(300);

/// Snapshot of a single domain's throttle state.
#[derive(Debug, Clone)]
pub struct ThrottleState {
    pub violations: u32,
    pub current_delay_seconds: u64,
    pub last_violation_ts: Option<Instant>,
    pub total_requests: u64,
    pub request_timestamps: Vec<Instant>,
}

struct DomainEntry {
    violations: u32,
    current_delay_seconds: u64,
    last_violation_ts: Option<Instant>,
    total_requests: u64,
    request_timestamps: VecDeque<Instant>,
}

impl Default for DomainEntry {
    fn default() -> Self {
        Self {
            violations: 0,
            current_delay_seconds: 0,
            last_violation_ts: None,
            total_requests: 0,
            request_timestamps: VecDeque::new(),
        }
    }
}

impl DomainEntry {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.request_timestamps.front() {
            if now.duration_since(*front) >= ONE_HOUR {
                self.request_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn decay_if_due(&mut self, now: Instant) {
        if let Some(last) = self.last_violation_ts {
            if now.duration_since(last) >= DECAY_INTERVAL {
                self.violations = 0;
                self.current_delay_seconds = 0;
                self.last_violation_ts = None;
            }
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        match self.last_violation_ts {
            Some(last) => now.duration_since(last) < Duration::from_secs(self.current_delay_seconds),
            None => false,
        }
    }
}

/// Consulted only on cache misses, before upstream dispatch — the cache-first
/// invariant of the pipeline (§4.3).
pub struct ThrottleManager {
    domains: DashMap<String, Mutex<DomainEntry>>,
    progressive_max_delay: u64,
}

impl ThrottleManager {
    pub fn new(progressive_max_delay: u64) -> Self {
        Self { domains: DashMap::new(), progressive_max_delay }
    }

    fn entry(&self, domain: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<DomainEntry>> {
        self.domains.entry(domain.to_string()).or_default();
        self.domains.get(domain).expect("entry just inserted")
    }

    /// Read-only: consults both the sliding window and cooldown.
    pub fn should_admit(&self, domain: &str, limit_per_hour: u32) -> bool {
        let now = Instant::now();
        let entry = self.entry(domain);
        let mut state = entry.lock().expect("throttle lock poisoned");
        state.decay_if_due(now);
        state.prune(now);
        if state.in_cooldown(now) {
            return false;
        }
        (state.request_timestamps.len() as u32) < limit_per_hour
    }

    /// Appends a timestamp to the window; evicts entries older than one hour.
    pub fn record_admission(&self, domain: &str) {
        let now = Instant::now();
        let entry = self.entry(domain);
        let mut state = entry.lock().expect("throttle lock poisoned");
        state.prune(now);
        state.request_timestamps.push_back(now);
        state.total_requests += 1;
    }

    /// Increments `violations` and grows `current_delay_seconds` toward the cap.
    pub fn record_violation(&self, domain: &str) {
        let now = Instant::now();
        let entry = self.entry(domain);
        let mut state = entry.lock().expect("throttle lock poisoned");
        state.violations += 1;
        let grown = BASE_DELAY_SECS.saturating_mul(1u64 << (state.violations - 1).min(62));
        state.current_delay_seconds = grown.min(self.progressive_max_delay);
        state.last_violation_ts = Some(now);
    }

    /// Seconds remaining in the current cooldown, if any.
    pub fn retry_after_secs(&self, domain: &str) -> u64 {
        let now = Instant::now();
        let entry = self.entry(domain);
        let state = entry.lock().expect("throttle lock poisoned");
        match state.last_violation_ts {
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs();
                state.current_delay_seconds.saturating_sub(elapsed).max(1)
            }
            None => 1,
        }
    }

    pub fn state(&self, domain: &str) -> ThrottleState {
        let now = Instant::now();
        let entry = self.entry(domain);
        let mut state = entry.lock().expect("throttle lock poisoned");
        state.prune(now);
        ThrottleState {
            violations: state.violations,
            current_delay_seconds: state.current_delay_seconds,
            last_violation_ts: state.last_violation_ts,
            total_requests: state.total_requests,
            request_timestamps: state.request_timestamps.iter().copied().collect(),
        }
    }
}
