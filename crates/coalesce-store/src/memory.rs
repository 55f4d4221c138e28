//! Process-local store: buffers and leases live in `DashMap`s.
//!
//! Coordinates concurrent tasks inside one process only. Uses the tokio
//! clock so paused-time tests drive expiry deterministically.

use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::Fragment;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;
use tracing::debug;

use crate::buffer::BufferStore;
use crate::error::Result;
use crate::lock::{CoordinationLock, LeaseToken, Release};

struct MemoryBuffer {
    fragments: Vec<Fragment>,
    last_append: Instant,
    expires_at: Instant,
}

struct MemoryLease {
    token: LeaseToken,
    held_until: Instant,
}

pub struct MemoryStore {
    buffers: DashMap<String, MemoryBuffer>,
    leases: DashMap<String, MemoryLease>,
    buffer_ttl: Duration,
}

impl MemoryStore {
    pub fn new(buffer_ttl: Duration) -> Self {
        Self {
            buffers: DashMap::new(),
            leases: DashMap::new(),
            buffer_ttl,
        }
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.buffers.iter().filter(|b| b.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BufferStore for MemoryStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn append(&self, sender: &str, fragment: &Fragment) -> Result<()> {
        let now = Instant::now();
        let mut buf = self
            .buffers
            .entry(sender.to_string())
            .or_insert_with(|| MemoryBuffer {
                fragments: Vec::new(),
                last_append: now,
                expires_at: now + self.buffer_ttl,
            });
        if buf.expires_at <= now {
            debug!(sender, dropped = buf.fragments.len(), "discarding expired buffer");
            buf.fragments.clear();
        }
        buf.fragments.push(fragment.clone());
        buf.last_append = now;
        buf.expires_at = now + self.buffer_ttl;
        Ok(())
    }

    async fn read_and_clear(&self, sender: &str) -> Result<Vec<Fragment>> {
        let now = Instant::now();
        Ok(self
            .buffers
            .remove(sender)
            .filter(|(_, buf)| buf.expires_at > now)
            .map(|(_, buf)| buf.fragments)
            .unwrap_or_default())
    }

    async fn quiet_for(&self, sender: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .buffers
            .get(sender)
            .filter(|buf| buf.expires_at > now)
            .map(|buf| now.saturating_duration_since(buf.last_append)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.buffers.len();
        self.buffers.retain(|_, buf| buf.expires_at > now);
        self.leases.retain(|_, lease| lease.held_until > now);
        Ok(before.saturating_sub(self.buffers.len()))
    }
}

#[async_trait]
impl CoordinationLock for MemoryStore {
    async fn try_acquire(&self, sender: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let now = Instant::now();
        let token = LeaseToken::new();
        let lease = MemoryLease {
            token: token.clone(),
            held_until: now + ttl,
        };
        match self.leases.entry(sender.to_string()) {
            Entry::Occupied(mut e) if e.get().held_until <= now => {
                e.insert(lease);
                Ok(Some(token))
            }
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(e) => {
                e.insert(lease);
                Ok(Some(token))
            }
        }
    }

    async fn extend(&self, sender: &str, token: &LeaseToken, ttl: Duration) -> Result<bool> {
        match self.leases.get_mut(sender) {
            Some(mut lease) if lease.token == *token => {
                lease.held_until = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, sender: &str, token: &LeaseToken) -> Result<Release> {
        if self
            .leases
            .remove_if(sender, |_, lease| lease.token == *token)
            .is_some()
        {
            return Ok(Release::Released);
        }
        let now = Instant::now();
        match self.leases.get(sender) {
            Some(lease) if lease.held_until > now => Ok(Release::HeldByOther),
            _ => Ok(Release::Absent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(text: &str) -> Fragment {
        Fragment {
            text: text.to_string(),
            display_name: "Ana".to_string(),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn drain_returns_arrival_order_then_empty() {
        let store = MemoryStore::new(Duration::from_secs(60));
        for t in ["a", "b", "c"] {
            store.append("s1", &frag(t)).await.unwrap();
        }
        let first = store.read_and_clear("s1").await.unwrap();
        let texts: Vec<_> = first.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(store.read_and_clear("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn senders_are_isolated() {
        let store = MemoryStore::new(Duration::from_secs(60));
        store.append("a", &frag("from-a")).await.unwrap();
        store.append("b", &frag("from-b")).await.unwrap();
        let a = store.read_and_clear("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].text, "from-a");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_buffer_is_dropped() {
        let store = MemoryStore::new(Duration::from_secs(5));
        store.append("s", &frag("old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.quiet_for("s").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.read_and_clear("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn append_after_expiry_starts_fresh_buffer() {
        let store = MemoryStore::new(Duration::from_secs(5));
        store.append("s", &frag("old")).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        store.append("s", &frag("new")).await.unwrap();
        let drained = store.read_and_clear("s").await.unwrap();
        assert_eq!(drained, vec![frag("new")]);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_for_tracks_last_append() {
        let store = MemoryStore::new(Duration::from_secs(60));
        store.append("s", &frag("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(
            store.quiet_for("s").await.unwrap(),
            Some(Duration::from_millis(700))
        );
        store.append("s", &frag("b")).await.unwrap();
        assert_eq!(store.quiet_for("s").await.unwrap(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn only_one_acquirer_wins() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let ttl = Duration::from_secs(3);
        assert!(store.try_acquire("s", ttl).await.unwrap().is_some());
        assert!(store.try_acquire("s", ttl).await.unwrap().is_none());
        assert!(store.try_acquire("other", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let old = store
            .try_acquire("s", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let new = store
            .try_acquire("s", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(old, new);
        assert_eq!(store.release("s", &old).await.unwrap(), Release::HeldByOther);
        assert!(!store.extend("s", &old, Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.release("s", &new).await.unwrap(), Release::Released);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let token = store
            .try_acquire("s", Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.release("s", &token).await.unwrap(), Release::Released);
        assert_eq!(store.release("s", &token).await.unwrap(), Release::Absent);
    }
}
