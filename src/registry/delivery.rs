//! Notification delivery targets
//!
//! A subscriber is either a webhook (HTTP POST of the JSON notification) or an
//! in-process push channel, e.g. the receiving end of a server-sent events
//! stream. Both sit behind [`Delivery`] so the registry worker does not care
//! which one it drives.

use crate::model::Notification;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP delivery failed: {0}")]
    Http(String),

    #[error("Webhook answered with status {0}")]
    Status(u16),

    #[error("Push channel closed")]
    ChannelClosed,

    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscriber queue full")]
    QueueFull,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError>;

    /// Human readable target, used in listings and logs
    fn describe(&self) -> String;
}

pub struct WebhookDelivery {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl WebhookDelivery {
    pub fn new(client: reqwest::Client, url: reqwest::Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        debug!("Webhook {} accepted notification", self.url);
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

pub struct ChannelDelivery {
    tx: mpsc::Sender<Notification>,
}

impl ChannelDelivery {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.tx
            .send(notification.clone())
            .await
            .map_err(|_| DeliveryError::ChannelClosed)
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}
