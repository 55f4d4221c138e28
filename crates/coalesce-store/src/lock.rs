use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Opaque proof of leadership returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a compare-and-delete on a sender's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Release {
    /// The caller's token was current and the lease is now gone.
    Released,
    /// No live lease exists (never taken, released, or TTL-expired).
    Absent,
    /// Another holder owns a live lease for this sender.
    HeldByOther,
}

/// Per-sender mutual exclusion with TTL auto-release.
#[async_trait]
pub trait CoordinationLock: Send + Sync {
    /// Atomic set-if-absent (or if expired) with expiry.
    ///
    /// Returns `Some(token)` iff the caller became leader.
    async fn try_acquire(&self, sender: &str, ttl: Duration) -> Result<Option<LeaseToken>>;

    /// Push the expiry of a lease the caller still holds. `false` when the
    /// token is no longer the stored one.
    async fn extend(&self, sender: &str, token: &LeaseToken, ttl: Duration) -> Result<bool>;

    /// Compare-and-delete. Idempotent: calling it on an expired or already
    /// released lease is a no-op reporting `Absent`.
    async fn release(&self, sender: &str, token: &LeaseToken) -> Result<Release>;
}

/// A backend providing both the buffer and the lease, as every shared
/// store does.
pub trait SharedStore: crate::buffer::BufferStore + CoordinationLock {}

impl<T: crate::buffer::BufferStore + CoordinationLock> SharedStore for T {}
