use thiserror::Error;

/// Errors raised by buffer store and lease backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Transport failure talking to a remote store.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote store answered with an error payload or an unexpected shape.
    #[error("Upstash error: {0}")]
    Upstash(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing credentials or an unusable path; the store was never built.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A thread panicked while holding the connection mutex.
    #[error("store connection mutex poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
