use std::fmt;

use async_trait::async_trait;
use coalesce_core::types::InboundText;

use crate::lease::LeaderDuty;

/// What a debouncer did with one inbound text.
pub enum Submission {
    /// Buffered in-process; a countdown owns the flush.
    Scheduled,
    /// Appended to the shared buffer; another invocation leads this burst.
    Follower,
    /// This invocation leads the burst and must run the duty to flush it.
    Leader(LeaderDuty),
    /// Dispatched immediately without buffering (degraded path).
    Forwarded,
}

impl Submission {
    pub fn into_duty(self) -> Option<LeaderDuty> {
        match self {
            Submission::Leader(duty) => Some(duty),
            _ => None,
        }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submission::Scheduled => write!(f, "Scheduled"),
            Submission::Follower => write!(f, "Follower"),
            Submission::Leader(duty) => write!(f, "Leader({})", duty.sender()),
            Submission::Forwarded => write!(f, "Forwarded"),
        }
    }
}

/// Result of one leader flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A consolidated record was handed to the dispatcher.
    Flushed { fragments: usize },
    /// The buffer was already drained; nothing to send.
    Empty,
    /// The lease was taken by a newer leader; the flush was abandoned.
    Superseded,
    /// The store could not be drained.
    StoreFailed,
}

/// Per-sender burst coalescing.
///
/// `submit` never waits out the window itself: the timer variant schedules
/// a countdown, the lease variant hands the wait to the caller as a
/// [`LeaderDuty`] so a whole inbound batch can be enqueued before anyone
/// sleeps.
#[async_trait]
pub trait Debouncer: Send + Sync {
    /// `"timer"`, `"lock"` or `"passthrough"`.
    fn mode(&self) -> &str;

    async fn submit(&self, text: InboundText) -> Submission;

    /// Bursts currently buffered by this process, when it can tell.
    fn pending(&self) -> Option<usize> {
        None
    }

    /// Flush everything buffered in-process right now (shutdown path).
    /// Returns how many bursts were flushed.
    async fn drain(&self) -> usize {
        0
    }
}
