//! Shared building blocks for the coalesce workspace: configuration,
//! error type, inbound/outbound wire types and sender canonicalization.

pub mod config;
pub mod error;
pub mod phone;
pub mod types;

pub use config::CoalesceConfig;
pub use error::{CoalesceError, Result};
pub use types::{ConsolidatedMessage, ImmediateMessage, InboundText, OutboundRecord};
