use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoalesceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed inbound event: {0}")]
    MalformedEvent(String),
}

pub type Result<T> = std::result::Result<T, CoalesceError>;
