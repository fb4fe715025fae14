use rumqttc::{MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Broker connection settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// First topic level shared by all device topics (`<prefix>/<deviceId>/...`)
    pub topic_prefix: String,
    /// QoS used for subscriptions and command publications (0, 1 or 2)
    pub qos: u8,
    /// Attempts for the initial connect before giving up
    pub connect_attempts: u32,
    /// Capacity of the client request queue and the inbound message stream
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "gasbridge".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            topic_prefix: "gas".to_string(),
            qos: 1,
            connect_attempts: 5,
            channel_capacity: 256,
        }
    }
}

// Credentials stay out of logs
impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("topic_prefix", &self.topic_prefix)
            .field("qos", &self.qos)
            .field("connect_attempts", &self.connect_attempts)
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

impl MqttConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Builds the rumqttc options for this broker
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)))
            .set_clean_session(true);

        if let Some(user) = &self.username {
            options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }

        options
    }
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}
