//! Topic Router
//!
//! Classifies broker publications by topic and decodes their JSON payloads.
//! Decoding is pure: it never touches shared state and never fails loudly.
//! Anything that cannot be understood becomes [`Message::Malformed`] so the
//! dispatch loop can log and drop it.
//!
//! # Topic Layout
//!
//! ```text
//! <prefix>/<deviceId>/telemetry   inbound   {deviceId, gasType, value, unit, observedAt}
//! <prefix>/<deviceId>/ack         inbound   {commandId, outcome, detail}
//! <prefix>/<deviceId>/command     outbound  {commandId, action, issuedAt}
//! ```

use crate::model::{AckOutcome, DeviceReading, GasType};
use crate::mqtt::InboundMessage;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use uuid::Uuid;

const TELEMETRY_SUFFIX: &str = "telemetry";
const ACK_SUFFIX: &str = "ack";
const COMMAND_SUFFIX: &str = "command";

/// Decoded broker publication
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Telemetry(DeviceReading),
    Acknowledgement {
        device_id: String,
        command_id: Uuid,
        outcome: AckOutcome,
        detail: Option<String>,
    },
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryPayload {
    device_id: String,
    gas_type: GasType,
    value: f64,
    unit: String,
    observed_at: Timestamp,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckPayload {
    command_id: Uuid,
    outcome: AckOutcome,
    #[serde(default)]
    detail: Option<String>,
}

/// Devices report either RFC 3339 strings or epoch milliseconds
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
}

impl Timestamp {
    fn into_utc(self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Rfc3339(at) => Some(at),
            Timestamp::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Channel<'a> {
    Telemetry(&'a str),
    Acknowledgement(&'a str),
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    prefix: String,
}

impl TopicRouter {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Filters the connection manager subscribes to
    pub fn subscription_filters(&self) -> Vec<String> {
        vec![
            format!("{}/+/{}", self.prefix, TELEMETRY_SUFFIX),
            format!("{}/+/{}", self.prefix, ACK_SUFFIX),
        ]
    }

    pub fn command_topic(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.prefix, device_id, COMMAND_SUFFIX)
    }

    fn classify<'a>(&self, topic: &'a str) -> Option<Channel<'a>> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let (device_id, suffix) = rest.split_once('/')?;
        if !device_id_is_valid(device_id) {
            return None;
        }
        match suffix {
            TELEMETRY_SUFFIX => Some(Channel::Telemetry(device_id)),
            ACK_SUFFIX => Some(Channel::Acknowledgement(device_id)),
            _ => None,
        }
    }

    pub fn decode(&self, message: &InboundMessage) -> Message {
        match self.classify(&message.topic) {
            Some(Channel::Telemetry(device_id)) => {
                decode_telemetry(device_id, &message.payload, message.received_at)
            }
            Some(Channel::Acknowledgement(device_id)) => decode_ack(device_id, &message.payload),
            None => Message::Malformed(format!("unrouted topic {}", message.topic)),
        }
    }
}

/// Device ids become a topic level, so MQTT metacharacters are not allowed
pub fn device_id_is_valid(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id.len() <= 128
        && !device_id
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#') || c.is_control())
}

fn decode_telemetry(topic_device: &str, payload: &[u8], received_at: DateTime<Utc>) -> Message {
    let parsed: TelemetryPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(e) => return Message::Malformed(format!("telemetry payload: {}", e)),
    };

    if parsed.device_id != topic_device {
        return Message::Malformed(format!(
            "device id {} does not match topic device {}",
            parsed.device_id, topic_device
        ));
    }
    if !parsed.value.is_finite() {
        return Message::Malformed(format!("non-finite value from {}", topic_device));
    }
    let Some(observed_at) = parsed.observed_at.into_utc() else {
        return Message::Malformed(format!("observedAt out of range from {}", topic_device));
    };

    Message::Telemetry(DeviceReading {
        device_id: parsed.device_id,
        gas_type: parsed.gas_type,
        value: parsed.value,
        unit: parsed.unit,
        observed_at,
        received_at,
    })
}

fn decode_ack(topic_device: &str, payload: &[u8]) -> Message {
    match serde_json::from_slice::<AckPayload>(payload) {
        Ok(ack) => Message::Acknowledgement {
            device_id: topic_device.to_string(),
            command_id: ack.command_id,
            outcome: ack.outcome,
            detail: ack.detail,
        },
        Err(e) => Message::Malformed(format!("ack payload: {}", e)),
    }
}
