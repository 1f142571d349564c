//! Content-addressed lookup/insert of response artifacts, grounded on the
//! `CacheManager` trait shape (`get`/`put`/`delete` by key) from the teacher's
//! `http-cache` crate, backed here by the pooled SQL [`Store`] instead of an
//! in-memory or disk-blob manager.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::store::Store;

/// Payloads larger than this are compressed before storage (§4.2).
const COMPRESSION_THRESHOLD: usize = 1024;

/// A cached upstream response. Only `status_code ∈ [200, 399]` entries are stored.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub fingerprint: String,
    pub domain_alias: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub ttl_seconds: u64,
    pub created_at: u64,
    pub last_accessed_at: u64,
    pub access_count: u64,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) < self.ttl_seconds
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub bytes_stored: u64,
    pub entries_per_domain: HashMap<String, u64>,
    pub ttl_distribution: HashMap<u64, u64>,
}

/// Computes the 256-bit request fingerprint: `method || 0x00 || url || 0x00 ||
/// canonical_body || 0x00 || content_type`. JSON bodies have their top-level
/// object keys sorted before hashing; all other bodies are hashed as-is.
pub fn generate_fingerprint(method: &str, url: &str, body: &[u8], content_type: &str) -> String {
    let canonical_body = canonicalize_body(body, content_type);
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(url.as_bytes());
    hasher.update(&[0u8]);
    hasher.update(&canonical_body);
    hasher.update(&[0u8]);
    hasher.update(content_type.as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn canonicalize_body(body: &[u8], content_type: &str) -> Vec<u8> {
    if body.is_empty() || !content_type.contains("json") {
        return body.to_vec();
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => {
            let canonical = sort_object_keys(value);
            serde_json::to_vec(&canonical).unwrap_or_else(|_| body.to_vec())
        }
        Err(_) => body.to_vec(),
    }
}

fn sort_object_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                map.into_iter().collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        other => other,
    }
}

#[derive(Serialize, Deserialize)]
struct StoredHeaders(HashMap<String, String>);

pub struct CacheEngine {
    store: Store,
    max_cache_response_size: usize,
    max_cache_entries: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
}

impl CacheEngine {
    pub fn new(store: Store, max_cache_response_size: usize, max_cache_entries: u64) -> Self {
        Self {
            store,
            max_cache_response_size,
            max_cache_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Returns the cached entry if present and fresh, updating access counters.
    /// An unfresh entry is deleted inline and `None` is returned.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<CachedResponse>, CacheError> {
        let fp = fingerprint.to_string();
        let row = self
            .store
            .execute_query(move |conn| {
                conn.query_row(
                    "SELECT fingerprint, domain, status, headers_blob, payload_blob, compressed,
                            created_at, ttl_seconds, last_accessed_at, access_count
                     FROM cache_entries WHERE fingerprint = ?1",
                    params![fp],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        let Some((
            fingerprint,
            domain_alias,
            status,
            headers_blob,
            payload_blob,
            compressed,
            created_at,
            ttl_seconds,
            last_accessed_at,
            access_count,
        )) = row
        else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let now = now_unix();
        let headers: HashMap<String, String> =
            serde_json::from_str::<StoredHeaders>(&headers_blob)?.0;
        let payload = if compressed != 0 { decompress(&payload_blob)? } else { payload_blob };

        let entry = CachedResponse {
            fingerprint: fingerprint.clone(),
            domain_alias,
            status_code: status as u16,
            headers,
            payload,
            ttl_seconds: ttl_seconds as u64,
            created_at: created_at as u64,
            last_accessed_at: last_accessed_at as u64,
            access_count: access_count as u64,
        };

        if !entry.is_fresh(now) {
            debug!(fingerprint = %fingerprint, "cache entry stale, evicting");
            let fp = fingerprint.clone();
            let _ = self
                .store
                .execute_update(move |conn| {
                    conn.execute("DELETE FROM cache_entries WHERE fingerprint = ?1", params![fp])
                })
                .await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        let fp = fingerprint.clone();
        let _ = self
            .store
            .execute_update(move |conn| {
                conn.execute(
                    "UPDATE cache_entries SET last_accessed_at = ?1, access_count = access_count + 1
                     WHERE fingerprint = ?2",
                    params![now as i64, fp],
                )
            })
            .await;

        Ok(Some(CachedResponse {
            access_count: entry.access_count + 1,
            last_accessed_at: now,
            ..entry
        }))
    }

    /// Stores a response if it is cacheable (status in [200, 399], size within
    /// `max_cache_response_size`). Returns whether it was actually stored.
    pub async fn store(
        &self,
        fingerprint: &str,
        domain_alias: &str,
        status_code: u16,
        headers: &HashMap<String, String>,
        payload: &[u8],
        ttl_seconds: u64,
    ) -> Result<bool, CacheError> {
        if !(200..=399).contains(&status_code) {
            return Ok(false);
        }
        if payload.len() > self.max_cache_response_size {
            return Ok(false);
        }

        let (stored_payload, compressed) = if payload.len() > COMPRESSION_THRESHOLD {
            match compress(payload) {
                Ok(compressed) => (compressed, true),
                Err(_) => (payload.to_vec(), false),
            }
        } else {
            (payload.to_vec(), false)
        };

        let headers_blob = serde_json::to_string(&StoredHeaders(headers.clone()))?;
        let now = now_unix();
        let fingerprint = fingerprint.to_string();
        let domain_alias = domain_alias.to_string();

        self.store
            .execute_update(move |conn| {
                conn.execute(
                    "INSERT INTO cache_entries
                     (fingerprint, domain, status, headers_blob, payload_blob, compressed,
                      created_at, ttl_seconds, last_accessed_at, access_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?7, 0)
                     ON CONFLICT(fingerprint) DO UPDATE SET
                        domain = excluded.domain,
                        status = excluded.status,
                        headers_blob = excluded.headers_blob,
                        payload_blob = excluded.payload_blob,
                        compressed = excluded.compressed,
                        created_at = excluded.created_at,
                        ttl_seconds = excluded.ttl_seconds,
                        last_accessed_at = excluded.last_accessed_at",
                    params![
                        fingerprint,
                        domain_alias,
                        status_code as i64,
                        headers_blob,
                        stored_payload,
                        compressed as i64,
                        now as i64,
                        ttl_seconds as i64,
                    ],
                )
            })
            .await?;

        self.stores.fetch_add(1, Ordering::Relaxed);
        self.evict_if_over_capacity().await;
        Ok(true)
    }

    /// Aggregate counters plus domain- and TTL-scoped row counts (§4.2).
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let rows: Vec<(String, u64, i64)> = self
            .store
            .execute_query(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT domain, LENGTH(payload_blob), ttl_seconds FROM cache_entries",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64, row.get::<_, i64>(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut entries_per_domain = HashMap::new();
        let mut ttl_distribution = HashMap::new();
        let mut bytes_stored = 0u64;
        for (domain, size, ttl) in rows {
            *entries_per_domain.entry(domain).or_insert(0u64) += 1;
            *ttl_distribution.entry(ttl as u64).or_insert(0u64) += 1;
            bytes_stored += size;
        }

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            bytes_stored,
            entries_per_domain,
            ttl_distribution,
        })
    }

    /// Deletes all rows for a domain, or every row if `domain_alias` is `None`.
    /// Returns the number of rows removed.
    pub async fn clear(&self, domain_alias: Option<&str>) -> Result<usize, CacheError> {
        let domain_alias = domain_alias.map(|s| s.to_string());
        let rows = self
            .store
            .execute_update(move |conn| match &domain_alias {
                Some(domain) => {
                    conn.execute("DELETE FROM cache_entries WHERE domain = ?1", params![domain])
                }
                None => conn.execute("DELETE FROM cache_entries", []),
            })
            .await?;
        Ok(rows)
    }

    async fn evict_if_over_capacity(&self) {
        let max_entries = self.max_cache_entries;
        let _ = self
            .store
            .execute_update(move |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE fingerprint IN (
                        SELECT fingerprint FROM cache_entries
                        ORDER BY last_accessed_at ASC
                        LIMIT MAX(0, (SELECT COUNT(*) FROM cache_entries) - ?1)
                    )",
                    params![max_entries as i64],
                )
            })
            .await;
    }
}

fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = generate_fingerprint("GET", "https://api.example.org/foo", b"", "");
        let b = generate_fingerprint("GET", "https://api.example.org/foo", b"", "");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_by_method() {
        let a = generate_fingerprint("GET", "https://api.example.org/foo", b"", "");
        let b = generate_fingerprint("POST", "https://api.example.org/foo", b"", "");
        assert_ne!(a, b);
    }

    #[test]
    fn json_body_canonicalization_ignores_key_order() {
        let a = generate_fingerprint(
            "POST",
            "https://api.example.org/foo",
            br#"{"b":1,"a":2}"#,
            "application/json",
        );
        let b = generate_fingerprint(
            "POST",
            "https://api.example.org/foo",
            br#"{"a":2,"b":1}"#,
            "application/json",
        );
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn round_trips_a_compressible_payload() {
        let store = Store::open(":memory:", 4).unwrap();
        let engine = CacheEngine::new(store, 10 * 1024 * 1024, 1000);
        let payload = vec![b'x'; 4096];
        let headers = HashMap::new();
        engine.store("fp1", "cn", 200, &headers, &payload, 3600).await.unwrap();
        let entry = engine.lookup("fp1").await.unwrap().expect("entry present");
        assert_eq!(entry.payload, payload);
    }

    #[tokio::test]
    async fn idempotent_store_leaves_one_row() {
        let store = Store::open(":memory:", 4).unwrap();
        let engine = CacheEngine::new(store.clone(), 10 * 1024 * 1024, 1000);
        let headers = HashMap::new();
        for _ in 0..5 {
            engine.store("fp1", "cn", 200, &headers, b"hello", 3600).await.unwrap();
        }
        let count: i64 = store
            .execute_query(|conn| {
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rejects_error_status_codes() {
        let store = Store::open(":memory:", 4).unwrap();
        let engine = CacheEngine::new(store, 10 * 1024 * 1024, 1000);
        let headers = HashMap::new();
        let stored = engine.store("fp1", "cn", 500, &headers, b"boom", 3600).await.unwrap();
        assert!(!stored);
    }

    #[tokio::test]
    async fn stats_track_hits_misses_stores_and_domain_breakdown() {
        let store = Store::open(":memory:", 4).unwrap();
        let engine = CacheEngine::new(store, 10 * 1024 * 1024, 1000);
        let headers = HashMap::new();
        engine.store("fp1", "cn", 200, &headers, b"hello", 60).await.unwrap();
        engine.store("fp2", "us", 200, &headers, b"world", 120).await.unwrap();
        engine.lookup("fp1").await.unwrap();
        engine.lookup("missing").await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.stores, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes_stored, 10);
        assert_eq!(stats.entries_per_domain.get("cn"), Some(&1));
        assert_eq!(stats.entries_per_domain.get("us"), Some(&1));
        assert_eq!(stats.ttl_distribution.get(&60), Some(&1));
        assert_eq!(stats.ttl_distribution.get(&120), Some(&1));
    }
}
