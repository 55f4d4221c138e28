//! Dispatcher: hands one outbound record to the configured sink.
//!
//! At-most-one attempt: failures are logged and the record is dropped; it is
//! never retried, re-queued, or re-buffered. The sender is canonicalized here
//! and nowhere earlier.

use std::sync::Arc;

use coalesce_core::config::SinkConfig;
use coalesce_core::phone;
use coalesce_core::types::OutboundRecord;
use tracing::{error, info, warn};

use crate::sink::{Sink, WebhookSink};

/// What happened to a record passed to [`Dispatcher::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Delivered,
    Failed,
    /// No sink configured; the record was dropped.
    Disabled,
}

#[derive(Clone)]
pub struct Dispatcher {
    sink: Option<Arc<dyn Sink>>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Permanent no-op dispatcher for a missing sink configuration.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Webhook sink when `sink.url` is set, otherwise a disabled dispatcher.
    pub fn from_config(config: &SinkConfig) -> Self {
        let Some(url) = config.url.as_deref().filter(|u| !u.is_empty()) else {
            error!("sink.url is not configured: outbound records will be dropped");
            return Self::disabled();
        };
        match WebhookSink::new(url, config.timeout()) {
            Ok(sink) => {
                info!(url, timeout_ms = config.timeout_ms, "webhook sink configured");
                Self::new(Arc::new(sink))
            }
            Err(e) => {
                error!(error = %e, "failed to build webhook sink: outbound records will be dropped");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver one record. Never fails to the caller.
    pub async fn emit(&self, record: OutboundRecord) -> EmitOutcome {
        let Some(sink) = &self.sink else {
            warn!(sender = %record.sender(), kind = %record.kind(), "no sink configured, record dropped");
            return EmitOutcome::Disabled;
        };

        let canonical = phone::canonicalize(record.sender());
        let record = record.with_sender(canonical);

        match sink.deliver(&record).await {
            Ok(()) => {
                info!(sink = sink.name(), sender = %record.sender(), kind = %record.kind(), "record forwarded");
                EmitOutcome::Delivered
            }
            Err(e) => {
                error!(
                    sink = sink.name(),
                    sender = %record.sender(),
                    kind = %record.kind(),
                    error = %e,
                    "failed to forward record"
                );
                EmitOutcome::Failed
            }
        }
    }
}
