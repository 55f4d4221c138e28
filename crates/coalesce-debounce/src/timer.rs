//! Single-process debouncer: sliding countdown per sender.
//!
//! Each fragment bumps the burst's generation and schedules a flush one
//! window later. A countdown only flushes if its generation is still the
//! burst's current one, so older countdowns become no-ops instead of being
//! cancelled. The check-and-remove is a single `DashMap::remove_if`, which
//! makes a fragment arriving mid-flush start a new burst rather than join
//! a drained one.
//!
//! A burst never outlives `max_wait` from its first fragment: the last
//! countdown is shortened so the flush lands on the cap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::{ConsolidatedMessage, Fragment, InboundText};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::coordinator::{Debouncer, Submission};
use crate::dispatcher::Dispatcher;

struct PendingBurst {
    fragments: Vec<Fragment>,
    generation: u64,
    started: Instant,
}

struct TimerInner {
    window: Duration,
    pending: DashMap<String, PendingBurst>,
    next_generation: AtomicU64,
    dispatcher: Dispatcher,
}

impl TimerInner {
    /// Flush `sender` iff `generation` is still the latest countdown.
    async fn flush_if_current(&self, sender: &str, generation: u64) {
        let Some((_, burst)) = self
            .pending
            .remove_if(sender, |_, burst| burst.generation == generation)
        else {
            return;
        };
        self.dispatch(sender, burst).await;
    }

    async fn dispatch(&self, sender: &str, burst: PendingBurst) {
        let count = burst.fragments.len();
        if let Some(msg) = ConsolidatedMessage::from_fragments(sender, &burst.fragments) {
            info!(sender, fragments = count, "flushing burst");
            self.dispatcher.emit(msg.into()).await;
        }
    }
}

pub struct TimerDebouncer {
    inner: Arc<TimerInner>,
    max_wait: Duration,
}

impl TimerDebouncer {
    pub fn new(window: Duration, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                window,
                pending: DashMap::new(),
                next_generation: AtomicU64::new(0),
                dispatcher,
            }),
            max_wait: Duration::MAX,
        }
    }

    /// Flush a burst at most `max_wait` after its first fragment.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

#[async_trait]
impl Debouncer for TimerDebouncer {
    fn mode(&self) -> &str {
        "timer"
    }

    async fn submit(&self, text: InboundText) -> Submission {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let fragment = text.fragment();
        let sender = text.sender_id;

        let now = Instant::now();
        // Shard lock is held only for this block.
        let (buffered, started) = match self.inner.pending.entry(sender.clone()) {
            Entry::Occupied(mut e) => {
                let burst = e.get_mut();
                burst.fragments.push(fragment);
                burst.generation = generation;
                (burst.fragments.len(), burst.started)
            }
            Entry::Vacant(e) => {
                e.insert(PendingBurst {
                    fragments: vec![fragment],
                    generation,
                    started: now,
                });
                (1, now)
            }
        };
        let delay = self
            .inner
            .window
            .min(self.max_wait.saturating_sub(now - started));
        debug!(sender = %sender, fragments = buffered, generation,
            delay_ms = delay.as_millis() as u64, "countdown (re)started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_if_current(&sender, generation).await;
        });
        Submission::Scheduled
    }

    fn pending(&self) -> Option<usize> {
        Some(self.inner.pending.len())
    }

    async fn drain(&self) -> usize {
        let senders: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut flushed = 0;
        for sender in senders {
            if let Some((_, burst)) = self.inner.pending.remove(&sender) {
                self.inner.dispatch(&sender, burst).await;
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(bursts = flushed, "drained pending bursts");
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use coalesce_core::types::OutboundRecord;
    use tokio::time::sleep;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn text(sender: &str, body: &str, ts: i64) -> InboundText {
        InboundText {
            sender_id: sender.to_string(),
            display_name: format!("name-{ts}"),
            text: body.to_string(),
            timestamp: ts,
        }
    }

    fn setup() -> (TimerDebouncer, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let debouncer = TimerDebouncer::new(WINDOW, Dispatcher::new(sink.clone()));
        (debouncer, sink)
    }

    fn texts(sink: &RecordingSink) -> Vec<(String, String)> {
        sink.records()
            .into_iter()
            .filter_map(|r| match r {
                OutboundRecord::Text(m) => Some((m.sender, m.text)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_consolidated_once() {
        let (d, sink) = setup();
        d.submit(text("15551234567", "Hi", 1)).await;
        sleep(Duration::from_millis(200)).await;
        d.submit(text("15551234567", "there", 2)).await;
        sleep(Duration::from_millis(200)).await;
        d.submit(text("15551234567", "!", 3)).await;

        sleep(Duration::from_millis(2100)).await;
        assert_eq!(
            texts(&sink),
            vec![("+15551234567".to_string(), "Hi there !".to_string())]
        );
        match &sink.records()[0] {
            OutboundRecord::Text(m) => {
                assert_eq!(m.timestamp, 1);
                assert_eq!(m.display_name, "name-1");
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(d.pending(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_on_each_fragment() {
        let (d, sink) = setup();
        d.submit(text("15551234567", "a", 1)).await;
        sleep(Duration::from_millis(1500)).await;
        d.submit(text("15551234567", "b", 2)).await;

        // 3400ms after the first fragment: first countdown has fired as a no-op.
        sleep(Duration::from_millis(1900)).await;
        assert!(sink.records().is_empty());

        // 2000ms after the second fragment.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(texts(&sink).len(), 1);
        assert_eq!(texts(&sink)[0].1, "a b");
    }

    #[tokio::test(start_paused = true)]
    async fn senders_are_isolated() {
        let (d, sink) = setup();
        d.submit(text("15550000001", "from-a", 1)).await;
        d.submit(text("15550000002", "from-b", 1)).await;
        d.submit(text("15550000001", "again-a", 2)).await;
        sleep(Duration::from_millis(2100)).await;

        let mut got = texts(&sink);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("+15550000001".to_string(), "from-a again-a".to_string()),
                ("+15550000002".to_string(), "from-b".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_gap_starts_a_new_burst() {
        let (d, sink) = setup();
        d.submit(text("15551234567", "first", 1)).await;
        sleep(Duration::from_millis(2500)).await;
        d.submit(text("15551234567", "second", 2)).await;
        sleep(Duration::from_millis(2500)).await;

        let got: Vec<String> = texts(&sink).into_iter().map(|(_, t)| t).collect();
        assert_eq!(got, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_flushes_everything_and_silences_countdowns() {
        let (d, sink) = setup();
        d.submit(text("15550000001", "a", 1)).await;
        d.submit(text("15550000002", "b", 1)).await;
        assert_eq!(d.pending(), Some(2));

        assert_eq!(d.drain().await, 2);
        assert_eq!(sink.records().len(), 2);

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbroken_burst_is_cut_at_max_wait() {
        let sink = Arc::new(RecordingSink::new());
        let d = TimerDebouncer::new(WINDOW, Dispatcher::new(sink.clone()))
            .with_max_wait(Duration::from_millis(6000));

        // A fragment every 1900ms never leaves a full window of quiet.
        d.submit(text("15551234567", "a", 1)).await;
        for (i, body) in ["b", "c", "d"].into_iter().enumerate() {
            sleep(Duration::from_millis(1900)).await;
            d.submit(text("15551234567", body, i as i64 + 2)).await;
        }
        // t=5700: the last countdown is shortened to land on 6000ms.
        sleep(Duration::from_millis(299)).await;
        assert!(sink.records().is_empty());
        sleep(Duration::from_millis(2)).await;
        assert_eq!(texts(&sink), vec![("+15551234567".to_string(), "a b c d".to_string())]);

        // The next fragment opens a fresh burst with its own cap.
        sleep(Duration::from_millis(1599)).await;
        d.submit(text("15551234567", "e", 6)).await;
        sleep(Duration::from_millis(2100)).await;
        let got: Vec<String> = texts(&sink).into_iter().map(|(_, t)| t).collect();
        assert_eq!(got, vec!["a b c d".to_string(), "e".to_string()]);
    }
}
