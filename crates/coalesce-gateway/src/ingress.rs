//! Ingress adapter: WhatsApp Cloud API deliveries into the debouncer.
//!
//! A delivery is walked as `entry[].changes[].value.messages[]`. Each
//! message is parsed on its own so one malformed entry never costs the
//! rest of the batch. Text goes to the debouncer, anything else is
//! dispatched at once. Leader duties are handed to the detached
//! [`DutyTracker`](coalesce_debounce::DutyTracker), so the delivery is
//! acknowledged without waiting out the burst.

use coalesce_core::types::{ImmediateMessage, InboundText, UNKNOWN_SENDER_NAME};
use coalesce_core::CoalesceError;
use coalesce_debounce::Submission;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app::AppState;

pub const WHATSAPP_OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Text(InboundText),
    Immediate(ImmediateMessage),
}

impl InboundEvent {
    pub fn sender(&self) -> &str {
        match self {
            InboundEvent::Text(t) => &t.sender_id,
            InboundEvent::Immediate(m) => &m.sender,
        }
    }
}

/// Counters for one processed delivery, logged by the webhook handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngressReport {
    pub buffered: usize,
    pub forwarded: usize,
    pub filtered: usize,
    /// Bursts this delivery was elected to lead.
    pub leaders: usize,
}

/// Extract every well-formed message from a delivery body.
pub fn parse_delivery(body: &Value) -> Vec<InboundEvent> {
    if body["object"].as_str() != Some(WHATSAPP_OBJECT) {
        debug!(object = ?body["object"], "ignoring delivery for another object type");
        return Vec::new();
    }

    let values = body["entry"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|entry| entry["changes"].as_array().into_iter().flatten())
        .map(|change| &change["value"]);

    let mut events = Vec::new();
    for value in values {
        let contacts = value["contacts"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        for message in value["messages"].as_array().into_iter().flatten() {
            match parse_message(message, contacts) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "skipping malformed message"),
            }
        }
    }
    events
}

fn parse_message(message: &Value, contacts: &[Value]) -> coalesce_core::Result<InboundEvent> {
    let sender = message["from"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing `from`"))?;
    let message_type = message["type"]
        .as_str()
        .ok_or_else(|| malformed("missing `type`"))?;
    let timestamp = parse_timestamp(&message["timestamp"])
        .ok_or_else(|| malformed("missing or invalid `timestamp`"))?;
    let display_name = resolve_name(sender, contacts);

    if message_type == "text" {
        let text = message["text"]["body"]
            .as_str()
            .ok_or_else(|| malformed("text message without `text.body`"))?;
        return Ok(InboundEvent::Text(InboundText {
            sender_id: sender.to_string(),
            display_name,
            text: text.to_string(),
            timestamp,
        }));
    }

    Ok(InboundEvent::Immediate(ImmediateMessage {
        sender: sender.to_string(),
        display_name,
        message_type: message_type.to_string(),
        payload: message.clone(),
        timestamp,
    }))
}

fn malformed(reason: &str) -> CoalesceError {
    CoalesceError::MalformedEvent(reason.to_string())
}

/// The platform sends unix seconds as a string.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Contact whose `wa_id` is the sender, else the first contact, else "Unknown".
fn resolve_name(sender: &str, contacts: &[Value]) -> String {
    let name_of = |c: &Value| {
        c["profile"]["name"]
            .as_str()
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    };
    contacts
        .iter()
        .find(|c| c["wa_id"].as_str() == Some(sender))
        .and_then(name_of)
        .or_else(|| contacts.first().and_then(name_of))
        .unwrap_or_else(|| UNKNOWN_SENDER_NAME.to_string())
}

/// Filter and route one parsed delivery; detach any leader duties.
pub async fn process(state: &AppState, events: Vec<InboundEvent>) -> IngressReport {
    let mut report = IngressReport::default();

    for event in events {
        if !state.filter.admits(event.sender()) {
            debug!(sender = %event.sender(), "sender filtered out");
            report.filtered += 1;
            continue;
        }
        match event {
            InboundEvent::Immediate(msg) => {
                debug!(sender = %msg.sender, message_type = %msg.message_type, "forwarding non-text message");
                state.dispatcher.emit(msg.into()).await;
                report.forwarded += 1;
            }
            InboundEvent::Text(text) => match state.debouncer.submit(text).await {
                Submission::Leader(duty) => {
                    report.buffered += 1;
                    report.leaders += 1;
                    state.duties.spawn(duty);
                }
                Submission::Scheduled | Submission::Follower => report.buffered += 1,
                Submission::Forwarded => report.forwarded += 1,
            },
        }
    }
    report
}
