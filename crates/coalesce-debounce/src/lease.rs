//! Multi-instance debouncer: every invocation appends to the shared buffer,
//! the one that wins the per-sender lease waits out the burst and flushes.
//!
//! The leader sleeps one window, then asks the store how long the buffer
//! has been quiet. While fragments keep arriving it sleeps the remainder
//! and extends its lease, so the flush happens one window after the *last*
//! fragment, matching the timer variant. A sender who never pauses is
//! flushed once the leader has waited `max_wait`.
//!
//! Leaders are meant to run detached from the request that elected them
//! ([`DutyTracker`]), so a dropped connection cannot strand the burst.
//!
//! Before draining, the leader compare-and-deletes its lease. If a newer
//! leader holds it (our lease lapsed and was re-acquired), the flush is
//! abandoned and the newer leader drains. A lapsed lease nobody re-took
//! still drains: `read_and_clear` is atomic, so each fragment reaches the
//! dispatcher at most once whichever leader gets there first.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::{ConsolidatedMessage, InboundText};
use coalesce_store::{LeaseToken, Release, SharedStore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Debouncer, FlushOutcome, Submission};
use crate::dispatcher::Dispatcher;

pub struct LeaseDebouncer {
    store: Arc<dyn SharedStore>,
    dispatcher: Dispatcher,
    window: Duration,
    lease_ttl: Duration,
    max_wait: Duration,
}

impl LeaseDebouncer {
    /// `lease_ttl` should exceed `window` by at least one store round-trip.
    pub fn new(
        store: Arc<dyn SharedStore>,
        dispatcher: Dispatcher,
        window: Duration,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            window,
            lease_ttl,
            max_wait: Duration::MAX,
        }
    }

    /// Stop sliding a burst once its leader has waited `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn duty(&self, sender: String, token: Option<LeaseToken>) -> LeaderDuty {
        LeaderDuty {
            sender,
            token,
            store: Arc::clone(&self.store),
            dispatcher: self.dispatcher.clone(),
            window: self.window,
            margin: self.lease_ttl.saturating_sub(self.window),
            max_wait: self.max_wait,
        }
    }
}

#[async_trait]
impl Debouncer for LeaseDebouncer {
    fn mode(&self) -> &str {
        "lock"
    }

    async fn submit(&self, text: InboundText) -> Submission {
        let sender = text.sender_id.clone();
        let fragment = text.fragment();

        if let Err(e) = self.store.append(&sender, &fragment).await {
            warn!(sender = %sender, backend = self.store.backend(), error = %e,
                "buffer append failed, forwarding fragment unbuffered");
            if let Some(msg) = ConsolidatedMessage::from_fragments(&sender, &[fragment]) {
                self.dispatcher.emit(msg.into()).await;
            }
            return Submission::Forwarded;
        }

        match self.store.try_acquire(&sender, self.lease_ttl).await {
            Ok(Some(token)) => {
                debug!(sender = %sender, lease = %token, "leading burst");
                Submission::Leader(self.duty(sender, Some(token)))
            }
            Ok(None) => {
                debug!(sender = %sender, "burst already led elsewhere, fragment appended");
                Submission::Follower
            }
            Err(e) => {
                // The fragment is buffered but no lease could be taken: lead
                // without one rather than leave it to the safety expiry.
                warn!(sender = %sender, error = %e, "lease acquisition failed, leading unleased");
                Submission::Leader(self.duty(sender, None))
            }
        }
    }
}

/// The flush obligation of a burst leader. Run it to completion.
pub struct LeaderDuty {
    sender: String,
    token: Option<LeaseToken>,
    store: Arc<dyn SharedStore>,
    dispatcher: Dispatcher,
    window: Duration,
    margin: Duration,
    max_wait: Duration,
}

impl fmt::Debug for LeaderDuty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderDuty")
            .field("sender", &self.sender)
            .field("leased", &self.token.is_some())
            .field("window", &self.window)
            .finish()
    }
}

impl LeaderDuty {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Wait until the burst is quiet, validate the lease, drain and dispatch.
    pub async fn run(self) -> FlushOutcome {
        self.wait_for_quiet().await;

        if let Some(token) = &self.token {
            match self.store.release(&self.sender, token).await {
                Ok(Release::Released) => {}
                Ok(Release::Absent) => {
                    debug!(sender = %self.sender, "lease lapsed before flush, draining anyway");
                }
                Ok(Release::HeldByOther) => {
                    warn!(sender = %self.sender, "lease superseded by a newer leader, abandoning flush");
                    return FlushOutcome::Superseded;
                }
                Err(e) => {
                    warn!(sender = %self.sender, error = %e, "lease validation failed, draining anyway");
                }
            }
        }

        let fragments = match self.store.read_and_clear(&self.sender).await {
            Ok(f) => f,
            Err(e) => {
                error!(sender = %self.sender, backend = self.store.backend(), error = %e,
                    "buffer drain failed, burst lost");
                return FlushOutcome::StoreFailed;
            }
        };

        match ConsolidatedMessage::from_fragments(&self.sender, &fragments) {
            Some(msg) => {
                info!(sender = %self.sender, fragments = fragments.len(), "flushing burst");
                self.dispatcher.emit(msg.into()).await;
                FlushOutcome::Flushed {
                    fragments: fragments.len(),
                }
            }
            None => {
                debug!(sender = %self.sender, "buffer already drained, nothing to flush");
                FlushOutcome::Empty
            }
        }
    }

    async fn wait_for_quiet(&self) {
        let started = Instant::now();
        let mut wait = self.window.min(self.max_wait);
        loop {
            tokio::time::sleep(wait).await;
            let waited = started.elapsed();
            if waited >= self.max_wait {
                info!(sender = %self.sender, waited_ms = waited.as_millis() as u64,
                    "burst reached max wait, flushing");
                return;
            }
            match self.store.quiet_for(&self.sender).await {
                Ok(Some(quiet)) if quiet < self.window => {
                    wait = (self.window - quiet).min(self.max_wait - waited);
                    debug!(sender = %self.sender, extend_ms = wait.as_millis() as u64, "burst still active");
                    self.extend_lease(wait + self.margin).await;
                }
                Ok(_) => return,
                Err(e) => {
                    warn!(sender = %self.sender, error = %e,
                        "could not read buffer activity, flushing on the fixed window");
                    return;
                }
            }
        }
    }

    async fn extend_lease(&self, ttl: Duration) {
        let Some(token) = &self.token else {
            return;
        };
        match self.store.extend(&self.sender, token, ttl).await {
            Ok(true) => {}
            Ok(false) => warn!(sender = %self.sender, "lease lost while extending"),
            Err(e) => warn!(sender = %self.sender, error = %e, "lease extension failed"),
        }
    }
}

/// Leader duties running detached from the requests that elected them.
#[derive(Clone, Default)]
pub struct DutyTracker {
    tasks: Arc<Mutex<JoinSet<FlushOutcome>>>,
}

impl DutyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<FlushOutcome>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `duty` on its own task. Finished duties are reaped here.
    pub fn spawn(&self, duty: LeaderDuty) {
        let mut tasks = self.tasks();
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(error = %e, "leader task failed");
            }
        }
        debug!(sender = %duty.sender, "leader detached");
        tasks.spawn(duty.run());
    }

    /// Duties spawned and not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every in-flight duty. Returns how many flushed a burst.
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks());
        let mut flushed = 0;
        while let Some(done) = tasks.join_next().await {
            match done {
                Ok(FlushOutcome::Flushed { .. }) => flushed += 1,
                Ok(_) => {}
                Err(e) => error!(error = %e, "leader task failed"),
            }
        }
        if flushed > 0 {
            info!(bursts = flushed, "in-flight leaders finished");
        }
        flushed
    }
}
