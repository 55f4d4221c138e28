//! Background sweep of buffers abandoned past their safety expiry.
//!
//! Expired buffers are dropped, never flushed: a burst whose leader died
//! and whose lease lapsed without a successor is lost. The sweep only
//! bounds how long its fragments linger.

use std::sync::Arc;
use std::time::Duration;

use coalesce_store::{BufferStore, SharedStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Drop expired buffers once. Returns how many were removed.
pub async fn sweep<S: BufferStore + ?Sized>(store: &S) -> usize {
    match store.purge_expired().await {
        Ok(0) => 0,
        Ok(n) => {
            warn!(backend = store.backend(), dropped = n, "dropped expired buffers without flushing");
            n
        }
        Err(e) => {
            error!(backend = store.backend(), error = %e, "buffer sweep failed");
            0
        }
    }
}

pub async fn run(store: Arc<dyn SharedStore>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(backend = store.backend(), interval_secs = every.as_secs(), "janitor started");
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep(store.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("janitor shutting down");
                    break;
                }
            }
        }
    }
}
