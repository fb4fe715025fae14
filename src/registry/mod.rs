//! # Subscriber Registry
//!
//! Holds the external consumers interested in reading changes and fans each
//! accepted reading out to them.
//!
//! ## Delivery Model
//!
//! ```text
//! notify(reading) ──try_send──► [queue A] ──► worker A ──► webhook / channel
//!                 ├─try_send──► [queue B] ──► worker B ──► ...
//!                 └─ (topic filter miss: skipped)
//! ```
//!
//! - `notify` only performs non-blocking enqueues, so the telemetry path never
//!   waits on a subscriber.
//! - Every subscriber has exactly one worker draining one FIFO queue, so
//!   successive readings reach the same subscriber in order.
//! - A delivery that still fails after its retries, times out, or finds the
//!   queue full counts as one failure. A success resets the count. Reaching
//!   `eviction_threshold` consecutive failures removes the subscriber.
//!
//! ## Locking
//!
//! Registration, unregistration and failure accounting go through one mutex.
//! It is never held across an `.await`.

pub mod delivery;

use crate::model::{DeviceReading, Notification};
use crate::mqtt::{Backoff, BackoffConfig};
use crate::router::device_id_is_valid;
use chrono::{DateTime, Utc};
use delivery::{ChannelDelivery, Delivery, DeliveryError, WebhookDelivery};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fan-out policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Consecutive failed deliveries before a subscriber is evicted
    pub eviction_threshold: u32,
    pub delivery_timeout_ms: u64,
    /// Extra attempts for a single notification before it counts as failed
    pub delivery_retries: u32,
    pub retry_backoff_ms: u64,
    /// Per-subscriber queue; a full queue counts as a failed delivery
    pub queue_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: 5,
            delivery_timeout_ms: 3_000,
            delivery_retries: 2,
            retry_backoff_ms: 200,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Subscriber {0} not found")]
    NotFound(Uuid),

    #[error("Invalid subscriber target: {0}")]
    InvalidTarget(String),

    #[error("Invalid topic filter: {0:?}")]
    InvalidTopic(String),
}

/// Where notifications for a subscriber go
pub enum SubscriberTarget {
    Webhook(String),
    Channel(mpsc::Sender<Notification>),
}

/// Public view of a registered subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub subscriber_id: Uuid,
    pub target: String,
    pub topics: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub failure_count: u32,
}

struct SubscriberSlot {
    target: String,
    topics: BTreeSet<String>,
    registered_at: DateTime<Utc>,
    failure_count: u32,
    queue: mpsc::Sender<DeviceReading>,
    cancel: CancellationToken,
}

impl SubscriberSlot {
    fn wants(&self, device_id: &str) -> bool {
        self.topics.is_empty() || self.topics.contains(device_id)
    }

    fn info(&self, id: Uuid) -> SubscriberInfo {
        SubscriberInfo {
            subscriber_id: id,
            target: self.target.clone(),
            topics: self.topics.iter().cloned().collect(),
            registered_at: self.registered_at,
            failure_count: self.failure_count,
        }
    }
}

struct RegistryInner {
    subscribers: Mutex<HashMap<Uuid, SubscriberSlot>>,
    config: SubscriberConfig,
    http: reqwest::Client,
}

impl RegistryInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<Uuid, SubscriberSlot>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_success(&self, id: Uuid) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.failure_count = 0;
        }
    }

    /// Returns true when the failure evicted the subscriber
    fn record_failure(&self, id: Uuid, error: &DeliveryError) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&id) else {
            return true;
        };
        slot.failure_count += 1;
        warn!(
            "Delivery to subscriber {} failed ({}/{}): {}",
            id, slot.failure_count, self.config.eviction_threshold, error
        );

        if slot.failure_count < self.config.eviction_threshold {
            return false;
        }
        if let Some(evicted) = slots.remove(&id) {
            evicted.cancel.cancel();
            warn!(
                "Evicted subscriber {} ({}) after {} consecutive failures",
                id, evicted.target, evicted.failure_count
            );
        }
        true
    }
}

/// Cloneable handle to the shared registry
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new(config: SubscriberConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: SubscriberConfig, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: Mutex::new(HashMap::new()),
                config,
                http,
            }),
        }
    }

    /// Registers a webhook or push channel for the given device ids (empty = all)
    pub fn register(
        &self,
        target: SubscriberTarget,
        topics: impl IntoIterator<Item = String>,
    ) -> Result<Uuid, RegistryError> {
        let delivery: Arc<dyn Delivery> = match target {
            SubscriberTarget::Webhook(url) => {
                let parsed = reqwest::Url::parse(&url)
                    .map_err(|e| RegistryError::InvalidTarget(format!("{}: {}", url, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(RegistryError::InvalidTarget(format!(
                        "{}: only http and https webhooks are supported",
                        url
                    )));
                }
                Arc::new(WebhookDelivery::new(self.inner.http.clone(), parsed))
            }
            SubscriberTarget::Channel(tx) => Arc::new(ChannelDelivery::new(tx)),
        };
        self.register_delivery(delivery, topics)
    }

    /// Opens a push channel subscription and returns its receiving end
    pub fn register_channel(
        &self,
        topics: impl IntoIterator<Item = String>,
    ) -> Result<(Uuid, mpsc::Receiver<Notification>), RegistryError> {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let id = self.register(SubscriberTarget::Channel(tx), topics)?;
        Ok((id, rx))
    }

    /// Registers an arbitrary delivery implementation
    pub fn register_delivery(
        &self,
        delivery: Arc<dyn Delivery>,
        topics: impl IntoIterator<Item = String>,
    ) -> Result<Uuid, RegistryError> {
        let mut filter = BTreeSet::new();
        for topic in topics {
            let topic = topic.trim().to_string();
            if topic.is_empty() {
                continue;
            }
            if !device_id_is_valid(&topic) {
                return Err(RegistryError::InvalidTopic(topic));
            }
            filter.insert(topic);
        }

        let id = Uuid::new_v4();
        let (queue, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let target = delivery.describe();

        self.inner.slots().insert(
            id,
            SubscriberSlot {
                target: target.clone(),
                topics: filter,
                registered_at: Utc::now(),
                failure_count: 0,
                queue,
                cancel: cancel.clone(),
            },
        );

        let worker = DeliveryWorker {
            id,
            delivery,
            queue: rx,
            cancel,
            registry: Arc::downgrade(&self.inner),
            timeout: Duration::from_millis(self.inner.config.delivery_timeout_ms.max(1)),
            retries: self.inner.config.delivery_retries,
            backoff: Backoff::from_config(&BackoffConfig {
                initial_ms: self.inner.config.retry_backoff_ms,
                max_ms: self.inner.config.retry_backoff_ms.saturating_mul(8),
                multiplier: 2.0,
                jitter: 0.1,
            }),
        };
        tokio::spawn(worker.run());

        info!("Registered subscriber {} -> {}", id, target);
        Ok(id)
    }

    pub fn unregister(&self, id: Uuid) -> Result<(), RegistryError> {
        match self.inner.slots().remove(&id) {
            Some(slot) => {
                slot.cancel.cancel();
                info!("Unregistered subscriber {} ({})", id, slot.target);
                Ok(())
            }
            None => Err(RegistryError::NotFound(id)),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<SubscriberInfo> {
        self.inner.slots().get(&id).map(|slot| slot.info(id))
    }

    pub fn list(&self) -> Vec<SubscriberInfo> {
        let mut all: Vec<SubscriberInfo> = self
            .inner
            .slots()
            .iter()
            .map(|(id, slot)| slot.info(*id))
            .collect();
        all.sort_by_key(|info| info.registered_at);
        all
    }

    pub fn len(&self) -> usize {
        self.inner.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues the reading for every interested subscriber without waiting
    pub fn notify(&self, reading: &DeviceReading) {
        let mut rejected = Vec::new();
        {
            let slots = self.inner.slots();
            for (id, slot) in slots.iter().filter(|(_, s)| s.wants(&reading.device_id)) {
                match slot.queue.try_send(reading.clone()) {
                    Ok(()) => debug!("Queued {} for subscriber {}", reading.device_id, id),
                    Err(TrySendError::Full(_)) => rejected.push((*id, DeliveryError::QueueFull)),
                    Err(TrySendError::Closed(_)) => {
                        rejected.push((*id, DeliveryError::ChannelClosed))
                    }
                }
            }
        }

        for (id, error) in rejected {
            self.inner.record_failure(id, &error);
        }
    }

    /// Cancels every worker; used on shutdown
    pub fn close(&self) {
        let mut slots = self.inner.slots();
        for (_, slot) in slots.drain() {
            slot.cancel.cancel();
        }
    }
}

struct DeliveryWorker {
    id: Uuid,
    delivery: Arc<dyn Delivery>,
    queue: mpsc::Receiver<DeviceReading>,
    cancel: CancellationToken,
    registry: Weak<RegistryInner>,
    timeout: Duration,
    retries: u32,
    backoff: Backoff,
}

impl DeliveryWorker {
    async fn run(mut self) {
        debug!("Delivery worker for {} started", self.id);

        loop {
            let reading = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(reading) => reading,
                    None => break,
                },
            };

            let notification = Notification {
                subscriber_id: self.id,
                reading,
                notified_at: Utc::now(),
            };
            let outcome = self.deliver_with_retry(&notification).await;

            let Some(registry) = self.registry.upgrade() else {
                break;
            };
            match outcome {
                Ok(()) => registry.record_success(self.id),
                Err(e) => {
                    if registry.record_failure(self.id, &e) {
                        break;
                    }
                }
            }
        }

        debug!("Delivery worker for {} stopped", self.id);
    }

    async fn deliver_with_retry(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.delivery.deliver(notification))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.timeout)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(DeliveryError::ChannelClosed) => return Err(DeliveryError::ChannelClosed),
                Err(e) if attempt < self.retries => {
                    debug!(
                        "Delivery to {} failed (attempt {}): {}, retrying",
                        self.id,
                        attempt + 1,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(self.backoff.delay(attempt)) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
