//! Domain types shared by the bridge components
//!
//! Everything that crosses a component boundary lives here: readings coming in
//! from the field, commands going out to it, and the notifications handed to
//! subscribers. Wire names are camelCase to match the device payloads and the
//! HTTP surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Gas measured by a sensing device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GasType {
    #[serde(rename = "CO", alias = "co")]
    Co,
    #[serde(rename = "CO2", alias = "co2")]
    Co2,
    #[serde(rename = "CH4", alias = "ch4")]
    Ch4,
    #[serde(rename = "H2S", alias = "h2s")]
    H2s,
    #[serde(rename = "O2", alias = "o2")]
    O2,
    #[serde(rename = "NO2", alias = "no2")]
    No2,
    #[serde(rename = "NH3", alias = "nh3")]
    Nh3,
    #[serde(rename = "LPG", alias = "lpg")]
    Lpg,
    #[serde(rename = "VOC", alias = "voc")]
    Voc,
}

impl GasType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GasType::Co => "CO",
            GasType::Co2 => "CO2",
            GasType::Ch4 => "CH4",
            GasType::H2s => "H2S",
            GasType::O2 => "O2",
            GasType::No2 => "NO2",
            GasType::Nh3 => "NH3",
            GasType::Lpg => "LPG",
            GasType::Voc => "VOC",
        }
    }
}

impl fmt::Display for GasType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GasType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CO" => Ok(GasType::Co),
            "CO2" => Ok(GasType::Co2),
            "CH4" => Ok(GasType::Ch4),
            "H2S" => Ok(GasType::H2s),
            "O2" => Ok(GasType::O2),
            "NO2" => Ok(GasType::No2),
            "NH3" => Ok(GasType::Nh3),
            "LPG" => Ok(GasType::Lpg),
            "VOC" => Ok(GasType::Voc),
            other => Err(format!("unknown gas type: {}", other)),
        }
    }
}

/// Latest known measurement of one device
///
/// `observed_at` is the device clock and decides ordering in the store;
/// `received_at` is the bridge clock and decides staleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: String,
    pub gas_type: GasType,
    pub value: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl DeviceReading {
    /// A reading is stale once its receipt is older than `window` at `now`
    pub fn is_stale_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.received_at) > window
    }
}

/// Reading as handed out by the store, with staleness evaluated at read time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSnapshot {
    #[serde(flatten)]
    pub reading: DeviceReading,
    pub stale: bool,
}

/// Control actions a gas device understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Start,
    Stop,
    Reset,
    Calibrate,
    SilenceAlarm,
    TestAlarm,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Start => "start",
            CommandAction::Stop => "stop",
            CommandAction::Reset => "reset",
            CommandAction::Calibrate => "calibrate",
            CommandAction::SilenceAlarm => "silence_alarm",
            CommandAction::TestAlarm => "test_alarm",
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "start" => Ok(CommandAction::Start),
            "stop" => Ok(CommandAction::Stop),
            "reset" => Ok(CommandAction::Reset),
            "calibrate" => Ok(CommandAction::Calibrate),
            "silence_alarm" => Ok(CommandAction::SilenceAlarm),
            "test_alarm" => Ok(CommandAction::TestAlarm),
            other => Err(format!("unknown command action: {}", other)),
        }
    }
}

/// Lifecycle of a control command
///
/// ```text
/// Pending ──► Acknowledged
///    ├──────► TimedOut
///    └──────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandState {
    Pending,
    Acknowledged,
    TimedOut,
    Failed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandState::Pending)
    }
}

/// Device answer to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    #[serde(alias = "acked", alias = "ACKED")]
    Acked,
    #[serde(alias = "nacked", alias = "NACKED")]
    Nacked,
}

/// Snapshot of a command owned by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: Uuid,
    pub device_id: String,
    pub action: CommandAction,
    pub issued_at: DateTime<Utc>,
    pub state: CommandState,
    pub resolved_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

/// Payload published on a device command topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: Uuid,
    pub action: CommandAction,
    pub issued_at: DateTime<Utc>,
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub subscriber_id: Uuid,
    pub reading: DeviceReading,
    pub notified_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_type_parses_wire_names() {
        let gas: GasType = serde_json::from_str("\"H2S\"").unwrap();
        assert_eq!(gas, GasType::H2s);
        assert_eq!("co2".parse::<GasType>().unwrap(), GasType::Co2);
        assert!("radon".parse::<GasType>().is_err());
    }

    #[test]
    fn command_action_accepts_dashes() {
        assert_eq!(
            "silence-alarm".parse::<CommandAction>().unwrap(),
            CommandAction::SilenceAlarm
        );
        assert_eq!(
            serde_json::to_string(&CommandAction::TestAlarm).unwrap(),
            "\"test_alarm\""
        );
    }

    #[test]
    fn staleness_uses_receipt_time() {
        let now = Utc::now();
        let reading = DeviceReading {
            device_id: "dev-1".into(),
            gas_type: GasType::Co,
            value: 3.0,
            unit: "ppm".into(),
            observed_at: now - Duration::hours(2),
            received_at: now - Duration::seconds(10),
        };
        assert!(!reading.is_stale_at(now, Duration::seconds(60)));
        assert!(reading.is_stale_at(now, Duration::seconds(5)));
    }

    #[test]
    fn only_pending_is_not_terminal() {
        assert!(!CommandState::Pending.is_terminal());
        assert!(CommandState::Acknowledged.is_terminal());
        assert!(CommandState::TimedOut.is_terminal());
        assert!(CommandState::Failed.is_terminal());
    }
}
