//! Broker connection lifecycle
//!
//! [`ConnectionManager::connect`] establishes the connection, subscribes to the
//! bridge's topic filters and spawns the event loop task. The returned
//! [`ConnectionHandle`] owns that task; [`MqttPublisher`] is the cheap, cloneable
//! publishing side handed to the command dispatcher.
//!
//! # Event Loop
//!
//! ```text
//! rumqttc EventLoop ──poll──► ConnAck  ──► Connected, resubscribe
//!                          ├► Publish  ──► InboundMessage ──► mpsc (ordered)
//!                          └► Err      ──► Reconnecting, sleep(backoff), poll again
//! ```

use super::backoff::Backoff;
use super::config::MqttConfig;
use super::message::InboundMessage;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Connection errors never reach request handlers; they are retried here.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Broker {address} unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        address: String,
        attempts: u32,
        reason: String,
    },

    #[error("Failed to subscribe to {topic}: {reason}")]
    SubscribeFailed { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("Broker connection is not established")]
    NotConnected,

    #[error("Publish rejected: {0}")]
    Rejected(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

/// Outbound side of the broker connection as seen by the command dispatcher
pub trait Publisher: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// Queues a publication without waiting; fails fast when disconnected.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError>;

    /// Health snapshot; publishers without counters only report their state
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connection_state: self.connection_state(),
            ..ConnectionStatus::default()
        }
    }
}

#[derive(Debug, Default)]
struct ConnectionStats {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    reconnects: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionStats {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Some(Utc::now());
        }
    }
}

/// Point-in-time view of the connection for health reporting
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connection_state: ConnectionState,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reconnects: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Publishing half of the connection
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    stats: Arc<ConnectionStats>,
}

impl MqttPublisher {
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

impl Publisher for MqttPublisher {
    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }

        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| PublishError::Rejected(e.to_string()))?;

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.touch();
        debug!("Queued publication on {}", topic);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connection_state: *self.state_rx.borrow(),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            last_activity: self.stats.last_activity.lock().ok().and_then(|g| *g),
        }
    }
}

/// Owner of the running event loop task
pub struct ConnectionHandle {
    publisher: MqttPublisher,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn publisher(&self) -> MqttPublisher {
        self.publisher.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.publisher.connection_state()
    }

    /// Sends DISCONNECT and stops the event loop
    ///
    /// The loop gets a short grace period to flush the DISCONNECT packet before
    /// it is cancelled outright.
    pub async fn shutdown(&mut self) {
        info!("Shutting down broker connection");

        if let Err(e) = self.publisher.client.try_disconnect() {
            warn!("Could not queue DISCONNECT: {}", e);
        }

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                debug!("Event loop did not stop within grace period, cancelling");
                self.cancel.cancel();
                if let Err(e) = task.await {
                    error!("Event loop task panicked: {}", e);
                }
            }
        }

        info!("Broker connection closed");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ConnectionManager {
    config: MqttConfig,
    backoff: Backoff,
    topic_filters: Vec<String>,
}

impl ConnectionManager {
    pub fn new(config: MqttConfig, backoff: Backoff, topic_filters: Vec<String>) -> Self {
        Self {
            config,
            backoff,
            topic_filters,
        }
    }

    /// Connects to the broker and spawns the event loop
    ///
    /// # Errors
    ///
    /// * [`ConnectionError::Unreachable`] - no ConnAck within `connect_attempts`
    /// * [`ConnectionError::SubscribeFailed`] - the subscription request could not be queued
    pub async fn connect(
        self,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let address = self.config.address();
        info!("Connecting to broker at {}", address);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (client, mut eventloop) =
            AsyncClient::new(self.config.mqtt_options(), self.config.channel_capacity.max(10));

        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to {} (session present: {})", address, ack.session_present);
                    break;
                }
                Ok(event) => debug!("Event before ConnAck: {:?}", event),
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt, attempts, address, e
                    );
                    if attempt >= attempts {
                        state_tx.send_replace(ConnectionState::Failed);
                        return Err(ConnectionError::Unreachable {
                            address,
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
                }
            }
        }

        subscribe_all(&client, &self.topic_filters, self.config.qos())?;
        state_tx.send_replace(ConnectionState::Connected);

        let stats = Arc::new(ConnectionStats::default());
        stats.touch();
        let publisher = MqttPublisher {
            client: client.clone(),
            state_rx,
            stats: stats.clone(),
        };

        let cancel = CancellationToken::new();
        let event_loop = EventLoopTask {
            client,
            eventloop,
            state_tx,
            stats,
            inbound_tx,
            backoff: self.backoff,
            topic_filters: self.topic_filters,
            qos: self.config.qos(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(event_loop.run());

        Ok(ConnectionHandle {
            publisher,
            cancel,
            task: Some(task),
        })
    }
}

fn subscribe_all(client: &AsyncClient, filters: &[String], qos: QoS) -> Result<(), ConnectionError> {
    for topic in filters {
        client
            .try_subscribe(topic.clone(), qos)
            .map_err(|e| ConnectionError::SubscribeFailed {
                topic: topic.clone(),
                reason: e.to_string(),
            })?;
        debug!("Subscribed to {}", topic);
    }
    Ok(())
}

struct EventLoopTask {
    client: AsyncClient,
    eventloop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<ConnectionStats>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    backoff: Backoff,
    topic_filters: Vec<String>,
    qos: QoS,
    cancel: CancellationToken,
}

impl EventLoopTask {
    async fn run(mut self) {
        info!("Broker event loop started");
        let mut failures: u32 = 0;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.stats.touch();
                    if self.inbound_tx.is_closed() {
                        debug!("Inbound stream closed, dropping message on {}", publish.topic);
                        continue;
                    }
                    let message = InboundMessage::from_topic(publish.topic, publish.payload.to_vec());
                    // Keep listening for cancellation while the consumer is behind
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = self.inbound_tx.send(message) => {
                            if sent.is_err() {
                                debug!("Inbound stream closed, message dropped");
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to broker, renewing subscriptions");
                    failures = 0;
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = subscribe_all(&self.client, &self.topic_filters, self.qos) {
                        error!("{}", e);
                    }
                    self.state_tx.send_replace(ConnectionState::Connected);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker sent DISCONNECT");
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("DISCONNECT sent, leaving event loop");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.state_tx.send_replace(ConnectionState::Reconnecting);
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        "Broker connection lost ({}), retry {} in {:?}",
                        e, failures, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Broker event loop stopped");
    }
}
