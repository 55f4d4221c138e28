use thiserror::Error;

/// Errors from delivering a record to the downstream sink.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport failure (connect, timeout, TLS).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The sink answered with a non-2xx status.
    #[error("sink returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Test/dry-run sink configured to refuse deliveries.
    #[error("sink rejected record: {0}")]
    Rejected(String),
}
