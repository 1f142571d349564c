//! Pooled embedded-SQL connection manager. Grounded on the WAL/busy_timeout/
//! `CREATE TABLE IF NOT EXISTS` idiom used for the pip-mapping SQLite cache in
//! the retrieval pack, adapted to an `r2d2` pool of `rusqlite` connections.

use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::warn;

use crate::error::StorageError;

const SCHEMA_VERSION: i64 = 1;
const MAX_RETRIES: u32 = 5;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Owns the connection pool and schema. A corrupt or lock-poisoned database file
/// is fatal at construction time, per §4.1's failure semantics.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn open(database_path: &str, max_pool_size: u32) -> Result<Self, StorageError> {
        let is_memory = database_path == ":memory:";

        // A plain `:memory:` handle is private to the connection that opened it;
        // every other connection the pool creates would see a blank database with
        // no schema. A shared-cache memory URI keeps all pooled connections on the
        // same backing database, and the pool is capped at one connection anyway
        // since SQLite drops a shared-cache memory database once its last
        // connection closes.
        let (manager, max_pool_size) = if is_memory {
            (SqliteConnectionManager::file("file::memory:?cache=shared").with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI,
            ), 1)
        } else {
            (SqliteConnectionManager::file(database_path), max_pool_size)
        };
        let manager = manager.with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;",
            )?;
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        });

        let pool = r2d2::Pool::builder()
            .max_size(max_pool_size)
            .build(manager)
            .map_err(StorageError::Pool)?;

        let store = Store { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.pool.get().map_err(StorageError::Pool)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers_blob TEXT NOT NULL,
                payload_blob BLOB NOT NULL,
                compressed INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_entries_domain_created
                ON cache_entries (domain, created_at);
            CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);",
        )
        .map_err(StorageError::Query)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
            .ok();
        if version.is_none() {
            conn.execute("INSERT INTO schema_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(StorageError::Query)?;
        }
        Ok(())
    }

    /// Read-only query; may run concurrently with other reads.
    pub async fn execute_query<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(StorageError::Pool)?;
            f(&conn).map_err(StorageError::Query)
        })
        .await
        .expect("store query task panicked")
    }

    /// A single-transaction write, retried on `SQLITE_BUSY`/`SQLITE_LOCKED` with
    /// bounded exponential backoff before surfacing [`StorageError::RetriesExhausted`].
    pub async fn execute_update<F>(&self, f: F) -> Result<usize, StorageError>
    where
        F: Fn(&rusqlite::Connection) -> rusqlite::Result<usize> + Send + Sync + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(StorageError::Pool)?;
            let mut delay = Duration::from_millis(20);
            for attempt in 0..MAX_RETRIES {
                match f(&conn) {
                    Ok(rows) => return Ok(rows),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if matches!(
                            err.code,
                            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                        ) =>
                    {
                        warn!(attempt, "store write contended, retrying");
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        return Ok(0)
                    }
                    Err(other) => return Err(StorageError::Query(other)),
                }
            }
            Err(StorageError::RetriesExhausted)
        })
        .await
        .expect("store write task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_creates_schema() {
        let store = Store::open(":memory:", 4).unwrap();
        let count: i64 = store
            .execute_query(|conn| {
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn update_reports_rows_affected() {
        let store = Store::open(":memory:", 4).unwrap();
        let rows = store
            .execute_update(|conn| {
                conn.execute(
                    "INSERT INTO cache_entries
                     (fingerprint, domain, status, headers_blob, payload_blob, compressed,
                      created_at, ttl_seconds, last_accessed_at, access_count)
                     VALUES ('fp', 'cn', 200, '{}', x'00', 0, 0, 60, 0, 0)",
                    [],
                )
            })
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }
}
