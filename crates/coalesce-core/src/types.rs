use serde::{Deserialize, Serialize};
use std::fmt;

/// Display name used when the inbound event carries no contact profile.
pub const UNKNOWN_SENDER_NAME: &str = "Unknown";

/// Separator placed between buffered fragments when a burst is consolidated.
pub const FRAGMENT_SEPARATOR: &str = " ";

/// One inbound text message, already extracted from the transport payload.
///
/// `sender_id` is the raw transport id; it is the buffer and lock key and is
/// never canonicalized before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundText {
    pub sender_id: String,
    pub display_name: String,
    pub text: String,
    /// Unix timestamp (seconds) reported by the transport.
    pub timestamp: i64,
}

impl InboundText {
    pub fn fragment(&self) -> Fragment {
        Fragment {
            text: self.text.clone(),
            display_name: self.display_name.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// A single buffered piece of a burst, as held by a buffer store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub display_name: String,
    pub timestamp: i64,
}

/// Text-consolidated outbound record: every fragment of one burst.
///
/// Field names on the wire match what the downstream workflow expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedMessage {
    #[serde(rename = "from")]
    pub sender: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub text: String,
    /// Timestamp of the first fragment in the burst.
    pub timestamp: i64,
}

impl ConsolidatedMessage {
    /// Join the fragments of a burst in arrival order.
    ///
    /// The display name and timestamp come from the first fragment. Returns
    /// `None` for an empty burst (nothing to dispatch).
    pub fn from_fragments(sender: &str, fragments: &[Fragment]) -> Option<Self> {
        let first = fragments.first()?;
        let text = fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(FRAGMENT_SEPARATOR);
        Some(Self {
            sender: sender.to_string(),
            display_name: first.display_name.clone(),
            text,
            timestamp: first.timestamp,
        })
    }
}

/// Non-text outbound record, forwarded without buffering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmediateMessage {
    #[serde(rename = "from")]
    pub sender: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub message_type: String,
    /// The full inbound message object, untouched.
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

/// Common transport shape handed to the downstream sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundRecord {
    Text(ConsolidatedMessage),
    Immediate(ImmediateMessage),
}

impl OutboundRecord {
    pub fn sender(&self) -> &str {
        match self {
            OutboundRecord::Text(m) => &m.sender,
            OutboundRecord::Immediate(m) => &m.sender,
        }
    }

    /// Replace the sender id, used to canonicalize at the dispatch boundary.
    pub fn with_sender(mut self, sender: String) -> Self {
        match &mut self {
            OutboundRecord::Text(m) => m.sender = sender,
            OutboundRecord::Immediate(m) => m.sender = sender,
        }
        self
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            OutboundRecord::Text(_) => RecordKind::Text,
            OutboundRecord::Immediate(_) => RecordKind::Immediate,
        }
    }
}

impl From<ConsolidatedMessage> for OutboundRecord {
    fn from(m: ConsolidatedMessage) -> Self {
        OutboundRecord::Text(m)
    }
}

impl From<ImmediateMessage> for OutboundRecord {
    fn from(m: ImmediateMessage) -> Self {
        OutboundRecord::Immediate(m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Text,
    Immediate,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Immediate => write!(f, "immediate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(text: &str, name: &str, ts: i64) -> Fragment {
        Fragment {
            text: text.to_string(),
            display_name: name.to_string(),
            timestamp: ts,
        }
    }

    #[test]
    fn consolidation_joins_with_single_space_in_order() {
        let frags = vec![frag("Hi", "Ana", 100), frag("there", "Ana", 101), frag("!", "Ana", 102)];
        let msg = ConsolidatedMessage::from_fragments("5511", &frags).unwrap();
        assert_eq!(msg.text, "Hi there !");
        assert_eq!(msg.timestamp, 100);
    }

    #[test]
    fn consolidation_keeps_first_seen_name() {
        let frags = vec![frag("a", "Ana", 1), frag("b", "Ana Maria", 2)];
        let msg = ConsolidatedMessage::from_fragments("5511", &frags).unwrap();
        assert_eq!(msg.display_name, "Ana");
    }

    #[test]
    fn consolidation_does_not_trim_or_dedupe() {
        let frags = vec![frag(" ok ", "x", 1), frag(" ok ", "x", 2)];
        let msg = ConsolidatedMessage::from_fragments("1", &frags).unwrap();
        assert_eq!(msg.text, " ok   ok ");
    }

    #[test]
    fn empty_burst_yields_nothing() {
        assert!(ConsolidatedMessage::from_fragments("1", &[]).is_none());
    }

    #[test]
    fn text_record_wire_shape() {
        let rec: OutboundRecord = ConsolidatedMessage {
            sender: "+15551234567".into(),
            display_name: "Bob".into(),
            text: "hello world".into(),
            timestamp: 1700000000,
        }
        .into();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "from": "+15551234567",
                "name": "Bob",
                "text": "hello world",
                "timestamp": 1700000000
            })
        );
    }

    #[test]
    fn immediate_record_wire_shape() {
        let rec: OutboundRecord = ImmediateMessage {
            sender: "+15551234567".into(),
            display_name: "Bob".into(),
            message_type: "image".into(),
            payload: serde_json::json!({"type": "image", "image": {"id": "m1"}}),
            timestamp: 5,
        }
        .into();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains(r#""message_type":"image""#));
        assert!(json.contains(r#""payload":{"#));
        assert!(!json.contains(r#""text""#));
        assert_eq!(rec.kind(), RecordKind::Immediate);
    }

    #[test]
    fn with_sender_rewrites_either_shape() {
        let rec: OutboundRecord = ConsolidatedMessage {
            sender: "1555".into(),
            display_name: "x".into(),
            text: "t".into(),
            timestamp: 0,
        }
        .into();
        assert_eq!(rec.with_sender("+1555".into()).sender(), "+1555");
    }
}
