use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::Fragment;

use crate::error::Result;

/// Append-only, per-sender ordered text buffer with a safety expiry.
///
/// A buffer exists only while it holds at least one undrained fragment.
/// Implementations must be `Send + Sync`; every call may race with other
/// tasks or other processes working on the same sender.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Stable lowercase backend name (e.g. `"sqlite"`), used in logs and `/health`.
    fn backend(&self) -> &str;

    /// Add a fragment to the end of the sender's buffer, creating it if absent.
    ///
    /// Refreshes the buffer's safety expiry. An already-expired buffer is
    /// discarded first, so the fragment starts a fresh one.
    async fn append(&self, sender: &str, fragment: &Fragment) -> Result<()>;

    /// Atomically return the whole buffer in arrival order and remove it.
    ///
    /// An absent or already-drained buffer yields an empty `Vec`, which
    /// makes a concurrent double drain a no-op for the loser.
    async fn read_and_clear(&self, sender: &str) -> Result<Vec<Fragment>>;

    /// Time elapsed since the last append to a live buffer, `None` if absent.
    async fn quiet_for(&self, sender: &str) -> Result<Option<Duration>>;

    /// Drop buffers whose safety expiry has passed. Returns how many were dropped.
    ///
    /// Backends whose keys expire natively keep the default no-op.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
