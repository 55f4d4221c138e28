use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use coalesce_core::types::OutboundRecord;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Downstream consumer of outbound records.
///
/// One call is one delivery attempt; implementations must not retry.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable lowercase identifier used in logs (e.g. `"webhook"`).
    fn name(&self) -> &str;

    async fn deliver(&self, record: &OutboundRecord) -> Result<(), DispatchError>;
}

/// POSTs each record as JSON to a fixed URL (an n8n webhook, typically).
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, record: &OutboundRecord) -> Result<(), DispatchError> {
        debug!(url = %self.url, sender = %record.sender(), "posting record to sink");

        let resp = self.client.post(&self.url).json(record).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "sink rejected record");
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// In-process sink that keeps every delivered record, for dry runs and tests.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<OutboundRecord>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that refuses every delivery.
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Snapshot of everything delivered so far, in delivery order.
    pub fn records(&self) -> Vec<OutboundRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, record: &OutboundRecord) -> Result<(), DispatchError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(DispatchError::Rejected("recording sink set to fail".to_string()));
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}
