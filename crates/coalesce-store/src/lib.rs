//! `coalesce-store`: shared ordered buffer store and per-sender lease.
//!
//! # Backends
//!
//! | Backend   | Scope                          | Atomic drain                 | Lease                      |
//! |-----------|--------------------------------|------------------------------|----------------------------|
//! | `memory`  | one process                    | `DashMap::remove`            | `DashMap` entry API        |
//! | `sqlite`  | every process sharing the file | `IMMEDIATE` transaction      | upsert guarded by expiry   |
//! | `upstash` | every process, any host        | `LRANGE` + `DEL` in MULTI    | `SET NX PX` + Lua CAS      |

pub mod buffer;
pub mod db;
pub mod error;
pub mod lock;
pub mod memory;
pub mod sqlite;
pub mod upstash;

use std::sync::Arc;

use coalesce_core::config::{StoreBackend, StoreConfig};

pub use buffer::BufferStore;
pub use error::{Result, StoreError};
pub use lock::{CoordinationLock, LeaseToken, Release, SharedStore};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use upstash::UpstashStore;

/// Build the backend selected in configuration.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    let ttl = config.buffer_ttl();
    let store: Arc<dyn SharedStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(ttl)),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.sqlite_path, ttl)?),
        StoreBackend::Upstash => Arc::new(UpstashStore::new(
            config.upstash_url.as_deref(),
            config.upstash_token.as_deref(),
            &config.key_prefix,
            ttl,
            config.request_timeout(),
        )?),
    };
    Ok(store)
}
