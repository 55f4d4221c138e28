//! `coalesce-debounce`: burst coalescing per sender and downstream dispatch.
//!
//! | Mode          | Coordination                         | Who flushes                      |
//! |---------------|--------------------------------------|----------------------------------|
//! | `timer`       | in-process countdown per sender      | the countdown task               |
//! | `lock`        | shared buffer + per-sender lease     | the invocation holding the lease |
//! | `passthrough` | none (store unavailable)             | nobody; each text goes out alone |
//!
//! Both coalescing modes use a sliding window: a burst is flushed one
//! window after its *last* fragment.

pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod lease;
pub mod passthrough;
pub mod sink;
pub mod timer;

use std::sync::Arc;

use coalesce_core::config::{DebounceConfig, DebounceMode, StoreConfig};
use tracing::{error, info};

pub use coordinator::{Debouncer, FlushOutcome, Submission};
pub use dispatcher::{Dispatcher, EmitOutcome};
pub use error::DispatchError;
pub use lease::{DutyTracker, LeaderDuty, LeaseDebouncer};
pub use passthrough::PassthroughDebouncer;
pub use sink::{RecordingSink, Sink, WebhookSink};
pub use timer::TimerDebouncer;

/// What a configured debouncer runs on, for `/health`.
#[derive(Clone)]
pub struct DebounceSetup {
    pub debouncer: Arc<dyn Debouncer>,
    pub store: Option<Arc<dyn coalesce_store::SharedStore>>,
}

/// Build the debouncer selected in configuration.
///
/// A store that cannot be opened degrades to [`PassthroughDebouncer`].
pub fn build_debouncer(
    debounce: &DebounceConfig,
    store: &StoreConfig,
    dispatcher: Dispatcher,
) -> DebounceSetup {
    match debounce.mode {
        DebounceMode::Timer => {
            info!(window_ms = debounce.window_ms, max_wait_ms = debounce.max_wait_ms,
                "debounce mode: in-process timer");
            DebounceSetup {
                debouncer: Arc::new(
                    TimerDebouncer::new(debounce.window(), dispatcher)
                        .with_max_wait(debounce.max_wait()),
                ),
                store: None,
            }
        }
        DebounceMode::Lock => match coalesce_store::open_store(store) {
            Ok(shared) => {
                info!(
                    window_ms = debounce.window_ms,
                    lease_ttl_ms = debounce.lock_ttl().as_millis() as u64,
                    max_wait_ms = debounce.max_wait_ms,
                    backend = shared.backend(),
                    "debounce mode: shared-store lease"
                );
                DebounceSetup {
                    debouncer: Arc::new(LeaseDebouncer::new(
                        Arc::clone(&shared),
                        dispatcher,
                        debounce.window(),
                        debounce.lock_ttl(),
                    )
                    .with_max_wait(debounce.max_wait())),
                    store: Some(shared),
                }
            }
            Err(e) => {
                error!(backend = %store.backend, error = %e,
                    "buffer store unavailable, text will be forwarded without debouncing");
                DebounceSetup {
                    debouncer: Arc::new(PassthroughDebouncer::new(dispatcher)),
                    store: None,
                }
            }
        },
    }
}
