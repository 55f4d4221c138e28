//! SQLite-backed store shared by every process that opens the same file.
//!
//! WAL mode plus a busy timeout lets independent instances append and race
//! for leases concurrently. Drains run inside an `IMMEDIATE` transaction so
//! the select-then-delete is atomic with respect to other writers.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::Fragment;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::buffer::BufferStore;
use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::lock::{CoordinationLock, LeaseToken, Release};

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    buffer_ttl: Duration,
}

impl SqliteStore {
    /// Open (or create) the shared database file.
    pub fn open(path: &str, buffer_ttl: Duration) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!(path, "opening SQLite buffer store");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, buffer_ttl)
    }

    /// Private in-memory database; useful for tests and single-process runs.
    pub fn open_in_memory(buffer_ttl: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, buffer_ttl)
    }

    fn with_connection(conn: Connection, buffer_ttl: Duration) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            buffer_ttl,
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl BufferStore for SqliteStore {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn append(&self, sender: &str, fragment: &Fragment) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let now = now_ms();
        let expires_at = now.saturating_add(millis(self.buffer_ttl));

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = tx.execute(
            "DELETE FROM buffer_fragments WHERE sender = ?1 AND expires_at <= ?2",
            rusqlite::params![sender, now],
        )?;
        if stale > 0 {
            debug!(sender, dropped = stale, "discarding expired buffer");
        }
        tx.execute(
            "INSERT INTO buffer_fragments
             (sender, text, display_name, timestamp, appended_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                sender,
                fragment.text,
                fragment.display_name,
                fragment.timestamp,
                now,
                expires_at
            ],
        )?;
        tx.execute(
            "UPDATE buffer_fragments SET expires_at = ?2 WHERE sender = ?1",
            rusqlite::params![sender, expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn read_and_clear(&self, sender: &str) -> Result<Vec<Fragment>> {
        let mut conn = self.lock_conn()?;
        let now = now_ms();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Collect inside the block so `stmt` is dropped before the DELETE.
        let fragments = {
            let mut stmt = tx.prepare_cached(
                "SELECT text, display_name, timestamp FROM buffer_fragments
                 WHERE sender = ?1 AND expires_at > ?2
                 ORDER BY seq",
            )?;
            let rows = stmt.query_map(rusqlite::params![sender, now], |row| {
                Ok(Fragment {
                    text: row.get(0)?,
                    display_name: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "DELETE FROM buffer_fragments WHERE sender = ?1",
            rusqlite::params![sender],
        )?;
        tx.commit()?;
        Ok(fragments)
    }

    async fn quiet_for(&self, sender: &str) -> Result<Option<Duration>> {
        let conn = self.lock_conn()?;
        let now = now_ms();
        let last: Option<i64> = conn.query_row(
            "SELECT MAX(appended_at) FROM buffer_fragments
             WHERE sender = ?1 AND expires_at > ?2",
            rusqlite::params![sender, now],
            |row| row.get(0),
        )?;
        Ok(last.map(|at| Duration::from_millis(now.saturating_sub(at).max(0) as u64)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let now = now_ms();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let senders: i64 = tx.query_row(
            "SELECT COUNT(DISTINCT sender) FROM buffer_fragments WHERE expires_at <= ?1",
            [now],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM buffer_fragments WHERE expires_at <= ?1", [now])?;
        tx.execute("DELETE FROM debounce_leases WHERE held_until <= ?1", [now])?;
        tx.commit()?;
        Ok(senders as usize)
    }
}

#[async_trait]
impl CoordinationLock for SqliteStore {
    async fn try_acquire(&self, sender: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let conn = self.lock_conn()?;
        let now = now_ms();
        let token = LeaseToken::new();

        // Inserts when absent, overwrites only an expired lease; a live lease
        // makes the upsert a no-op (0 rows changed).
        let changed = conn.execute(
            "INSERT INTO debounce_leases (sender, token, held_until)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(sender) DO UPDATE
                SET token = excluded.token, held_until = excluded.held_until
                WHERE debounce_leases.held_until <= ?4",
            rusqlite::params![sender, token.as_str(), now.saturating_add(millis(ttl)), now],
        )?;
        Ok((changed == 1).then_some(token))
    }

    async fn extend(&self, sender: &str, token: &LeaseToken, ttl: Duration) -> Result<bool> {
        let conn = self.lock_conn()?;
        let held_until = now_ms().saturating_add(millis(ttl));
        let changed = conn.execute(
            "UPDATE debounce_leases SET held_until = ?3 WHERE sender = ?1 AND token = ?2",
            rusqlite::params![sender, token.as_str(), held_until],
        )?;
        Ok(changed == 1)
    }

    async fn release(&self, sender: &str, token: &LeaseToken) -> Result<Release> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM debounce_leases WHERE sender = ?1 AND token = ?2",
            rusqlite::params![sender, token.as_str()],
        )?;
        if deleted == 1 {
            return Ok(Release::Released);
        }
        let held_until: Option<i64> = conn
            .query_row(
                "SELECT held_until FROM debounce_leases WHERE sender = ?1",
                [sender],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match held_until {
            Some(until) if until > now_ms() => Release::HeldByOther,
            _ => Release::Absent,
        })
    }
}
