//! # MQTT Integration Module
//!
//! Owns the bridge's single connection to the message broker. Field devices are
//! only reachable through the broker, so everything the bridge learns about gas
//! levels and command outcomes enters here, and every command leaves through here.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs      - Broker and reconnect-backoff settings
//! ├── backoff.rs     - Exponential backoff with bounded jitter
//! ├── message.rs     - Inbound message representation
//! └── connection.rs  - Connection lifecycle, event loop and publishing
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ──► Connected ──► Reconnecting ──► Connected ...
//!     │                              │
//!     └──► Failed (budget spent)      └──► Disconnected (shutdown)
//! ```
//!
//! - The initial connect is retried up to `connect_attempts` times, then fails.
//! - Once connected, disconnects are retried forever with capped backoff and
//!   the telemetry/ack subscriptions are renewed on every ConnAck.
//! - Publishing never waits for a reconnect: it fails immediately when the
//!   connection is not up.
//!
//! ## Inbound Stream
//!
//! Publications arrive on a single ordered `mpsc` stream of [`InboundMessage`]s
//! stamped with their receipt time. One dispatch loop consumes it.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod message;

pub use backoff::Backoff;
pub use config::{BackoffConfig, MqttConfig};
pub use connection::{
    ConnectionError, ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus,
    MqttPublisher, PublishError, Publisher,
};
pub use message::InboundMessage;
