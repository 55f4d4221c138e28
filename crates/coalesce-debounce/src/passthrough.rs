use async_trait::async_trait;
use coalesce_core::types::{ConsolidatedMessage, InboundText};
use tracing::debug;

use crate::coordinator::{Debouncer, Submission};
use crate::dispatcher::Dispatcher;

/// Forwards every text immediately as a one-fragment record.
///
/// Used when the configured store could not be built, so text keeps
/// flowing (uncoalesced) instead of being dropped.
pub struct PassthroughDebouncer {
    dispatcher: Dispatcher,
}

impl PassthroughDebouncer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Debouncer for PassthroughDebouncer {
    fn mode(&self) -> &str {
        "passthrough"
    }

    async fn submit(&self, text: InboundText) -> Submission {
        debug!(sender = %text.sender_id, "debouncing unavailable, forwarding text as-is");
        if let Some(msg) = ConsolidatedMessage::from_fragments(&text.sender_id, &[text.fragment()]) {
            self.dispatcher.emit(msg.into()).await;
        }
        Submission::Forwarded
    }
}
