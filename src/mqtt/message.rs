use chrono::{DateTime, Utc};
use std::fmt;

/// Raw publication received from the broker, stamped on arrival
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(48).collect();
        write!(f, "{} {} - {}", self.received_at, self.topic, preview)
    }
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received(topic, payload, Utc::now())
    }

    pub fn received(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let msg = InboundMessage::from_topic("gas/dev-1/telemetry", "x".repeat(200));
        let shown = msg.to_string();
        assert!(shown.contains("gas/dev-1/telemetry"));
        assert!(shown.len() < 200);
    }

    #[test]
    fn display_survives_binary_payloads() {
        let msg = InboundMessage::from_topic("gas/dev-1/telemetry", vec![0xff, 0xfe, 0x00]);
        assert!(msg.to_string().contains("gas/dev-1/telemetry"));
    }
}
