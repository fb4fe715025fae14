//! # Command Dispatcher
//!
//! Turns control requests into broker publications and follows each command
//! until the device answers or the acknowledgement timeout expires.
//!
//! ## Command Lifecycle
//!
//! ```text
//!            submit()
//!               │
//!               ▼
//!           Pending ──ack(Acked)──────► Acknowledged
//!               ├────ack(Nacked)──────► Failed
//!               ├────publish error────► Failed   (reported to the submitter)
//!               └────ack timeout──────► TimedOut
//! ```
//!
//! Every terminal transition happens once. Late acknowledgements, duplicates and
//! acknowledgements for ids the dispatcher never issued are logged and dropped.
//!
//! ## Pair Lock
//!
//! At most one Pending command may exist per `(deviceId, action)`. The lock is
//! taken atomically on submit and released by whichever terminal transition
//! happens first, so a new command for the pair can follow immediately.
//!
//! Both the command table and the pair locks are sharded maps: commands for
//! unrelated devices never wait on each other.

pub mod error;

pub use error::DispatchError;

use crate::model::{AckOutcome, CommandAction, CommandPayload, CommandRecord, CommandState};
use crate::mqtt::{ConnectionState, PublishError, Publisher};
use crate::router::{device_id_is_valid, TopicRouter};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Time a device has to acknowledge a command before it is TimedOut
    pub ack_timeout_ms: u64,
    /// Default time an HTTP caller waits for a command to resolve
    pub request_timeout_ms: u64,
    /// How long terminal commands stay queryable
    pub retention_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            retention_secs: 3_600,
        }
    }
}

struct CommandEntry {
    record: CommandRecord,
    state_tx: watch::Sender<CommandState>,
    timer: Option<AbortHandle>,
}

type PairKey = (String, CommandAction);

struct DispatcherInner {
    commands: DashMap<Uuid, CommandEntry>,
    pending: DashMap<PairKey, Uuid>,
    publisher: Arc<dyn Publisher>,
    router: TopicRouter,
    qos: QoS,
    ack_timeout: Duration,
}

impl DispatcherInner {
    /// Moves a Pending command to `state`; false if it was unknown or already terminal
    fn finish(&self, command_id: Uuid, state: CommandState, detail: Option<String>) -> bool {
        let Some(mut entry) = self.commands.get_mut(&command_id) else {
            return false;
        };
        if entry.record.state.is_terminal() {
            return false;
        }

        entry.record.state = state;
        entry.record.resolved_at = Some(Utc::now());
        entry.record.detail = detail;
        entry.state_tx.send_replace(state);
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let key = (entry.record.device_id.clone(), entry.record.action);
        self.pending
            .remove_if(&key, |_, pending_id| *pending_id == command_id);
        true
    }

    fn publish(&self, device_id: &str, payload: &CommandPayload) -> Result<(), PublishError> {
        if self.publisher.connection_state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        let bytes = serde_json::to_vec(payload).map_err(|e| PublishError::Encode(e.to_string()))?;
        self.publisher
            .publish(&self.router.command_topic(device_id), bytes, self.qos)
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CommandDispatcher {
    pub fn new(
        config: &CommandConfig,
        publisher: Arc<dyn Publisher>,
        router: TopicRouter,
        qos: QoS,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                commands: DashMap::new(),
                pending: DashMap::new(),
                publisher,
                router,
                qos,
                ack_timeout: Duration::from_millis(config.ack_timeout_ms.max(1)),
            }),
        }
    }

    /// Publishes `action` to `device_id` and starts its acknowledgement timer
    ///
    /// # Errors
    ///
    /// * [`DispatchError::InvalidDevice`] - the id cannot be used in a topic
    /// * [`DispatchError::Conflict`] - the same action is already pending for the device
    /// * [`DispatchError::Publish`] - the broker refused or is disconnected; the
    ///   command exists and is Failed
    pub fn submit(&self, device_id: &str, action: CommandAction) -> Result<Uuid, DispatchError> {
        if !device_id_is_valid(device_id) {
            return Err(DispatchError::InvalidDevice(device_id.to_string()));
        }

        let command_id = Uuid::new_v4();
        match self.inner.pending.entry((device_id.to_string(), action)) {
            Entry::Occupied(existing) => {
                debug!(
                    "Rejecting {} for {}: {} still pending",
                    action,
                    device_id,
                    existing.get()
                );
                return Err(DispatchError::Conflict {
                    device_id: device_id.to_string(),
                    action,
                    pending: *existing.get(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(command_id);
            }
        }

        let issued_at = Utc::now();
        let (state_tx, _) = watch::channel(CommandState::Pending);
        self.inner.commands.insert(
            command_id,
            CommandEntry {
                record: CommandRecord {
                    command_id,
                    device_id: device_id.to_string(),
                    action,
                    issued_at,
                    state: CommandState::Pending,
                    resolved_at: None,
                    detail: None,
                },
                state_tx,
                timer: None,
            },
        );

        let payload = CommandPayload {
            command_id,
            action,
            issued_at,
        };
        if let Err(e) = self.inner.publish(device_id, &payload) {
            warn!("Command {} to {} failed: {}", command_id, device_id, e);
            self.inner
                .finish(command_id, CommandState::Failed, Some(e.to_string()));
            return Err(DispatchError::Publish {
                command_id,
                source: e,
            });
        }

        let timer = tokio::spawn(expire_at(
            Arc::downgrade(&self.inner),
            command_id,
            Instant::now() + self.inner.ack_timeout,
            self.inner.ack_timeout,
        ));
        match self.inner.commands.get_mut(&command_id) {
            Some(mut entry) if entry.record.state == CommandState::Pending => {
                entry.timer = Some(timer.abort_handle());
            }
            _ => timer.abort(),
        }

        info!("Command {} ({}) sent to {}", command_id, action, device_id);
        Ok(command_id)
    }

    /// Applies an acknowledgement from `device_id`; returns whether it resolved a Pending command
    ///
    /// Acknowledgements only count when they arrive from the device the command
    /// was sent to.
    pub fn resolve(
        &self,
        device_id: &str,
        command_id: Uuid,
        outcome: AckOutcome,
        detail: Option<String>,
    ) -> bool {
        let target = self
            .inner
            .commands
            .get(&command_id)
            .map(|entry| entry.record.device_id.clone());
        if let Some(target) = target.filter(|target| target != device_id) {
            debug!(
                "Discarding acknowledgement for command {} from {}, it was sent to {}",
                command_id, device_id, target
            );
            return false;
        }

        let (state, detail) = match outcome {
            AckOutcome::Acked => (CommandState::Acknowledged, detail),
            AckOutcome::Nacked => (
                CommandState::Failed,
                Some(detail.unwrap_or_else(|| "negative acknowledgement".to_string())),
            ),
        };

        if self.inner.finish(command_id, state, detail) {
            info!("Command {} resolved as {:?}", command_id, state);
            return true;
        }

        if self.inner.commands.contains_key(&command_id) {
            debug!(
                "Discarding acknowledgement for already terminal command {}",
                command_id
            );
        } else {
            debug!("Discarding acknowledgement for unknown command {}", command_id);
        }
        false
    }

    pub fn status(&self, command_id: Uuid) -> Result<CommandRecord, DispatchError> {
        self.inner
            .commands
            .get(&command_id)
            .map(|entry| entry.record.clone())
            .ok_or(DispatchError::NotFound(command_id))
    }

    /// Waits up to `timeout` for the command to become terminal
    ///
    /// Returns the record either way; when the wait expires the command simply
    /// remains Pending in the dispatcher.
    pub async fn await_resolution(
        &self,
        command_id: Uuid,
        timeout: Duration,
    ) -> Result<CommandRecord, DispatchError> {
        let mut state_rx = self
            .inner
            .commands
            .get(&command_id)
            .map(|entry| entry.state_tx.subscribe())
            .ok_or(DispatchError::NotFound(command_id))?;

        if tokio::time::timeout(timeout, state_rx.wait_for(|state| state.is_terminal()))
            .await
            .is_err()
        {
            debug!("Caller stopped waiting for command {}", command_id);
        }
        self.status(command_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Drops terminal commands resolved longer ago than `older_than`
    pub fn purge_terminal(&self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let before = self.inner.commands.len();
        self.inner.commands.retain(|_, entry| {
            !(entry.record.state.is_terminal()
                && entry.record.resolved_at.is_some_and(|at| at < cutoff))
        });
        let purged = before.saturating_sub(self.inner.commands.len());
        if purged > 0 {
            debug!("Purged {} terminal commands", purged);
        }
        purged
    }
}

async fn expire_at(
    inner: Weak<DispatcherInner>,
    command_id: Uuid,
    deadline: Instant,
    timeout: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.finish(
        command_id,
        CommandState::TimedOut,
        Some(format!("no acknowledgement within {:?}", timeout)),
    ) {
        warn!("Command {} timed out", command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePublisher;

    const ACK_TIMEOUT: Duration = Duration::from_millis(1_000);

    fn dispatcher() -> (CommandDispatcher, Arc<FakePublisher>) {
        let publisher = Arc::new(FakePublisher::default());
        let config = CommandConfig {
            ack_timeout_ms: ACK_TIMEOUT.as_millis() as u64,
            ..CommandConfig::default()
        };
        let dispatcher = CommandDispatcher::new(
            &config,
            publisher.clone(),
            TopicRouter::new("gas"),
            QoS::AtLeastOnce,
        );
        (dispatcher, publisher)
    }

    #[tokio::test]
    async fn publishes_command_payload_on_device_topic() {
        let (dispatcher, publisher) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::Calibrate).unwrap();

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "gas/dev-1/command");
        let payload: CommandPayload = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(payload.command_id, id);
        assert_eq!(payload.action, CommandAction::Calibrate);
        assert_eq!(dispatcher.status(id).unwrap().state, CommandState::Pending);
    }

    #[tokio::test]
    async fn duplicate_pending_pair_conflicts_until_acknowledged() {
        let (dispatcher, _) = dispatcher();
        let first = dispatcher.submit("dev-1", CommandAction::Reset).unwrap();

        match dispatcher.submit("dev-1", CommandAction::Reset) {
            Err(DispatchError::Conflict { pending, .. }) => assert_eq!(pending, first),
            other => panic!("expected conflict, got {:?}", other),
        }
        // Other actions and other devices are independent
        dispatcher.submit("dev-1", CommandAction::Stop).unwrap();
        dispatcher.submit("dev-2", CommandAction::Reset).unwrap();

        assert!(dispatcher.resolve("dev-1", first, AckOutcome::Acked, None));
        assert_eq!(
            dispatcher.status(first).unwrap().state,
            CommandState::Acknowledged
        );
        let second = dispatcher.submit("dev-1", CommandAction::Reset).unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_ignores_late_acks() {
        let (dispatcher, _) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::TestAlarm).unwrap();

        tokio::time::sleep(ACK_TIMEOUT + Duration::from_millis(1)).await;
        let timed_out = dispatcher.status(id).unwrap();
        assert_eq!(timed_out.state, CommandState::TimedOut);
        assert!(timed_out.resolved_at.is_some());

        assert!(!dispatcher.resolve("dev-1", id, AckOutcome::Acked, None));
        tokio::time::sleep(ACK_TIMEOUT * 2).await;
        assert_eq!(dispatcher.status(id).unwrap(), timed_out);

        // The pair lock was released by the timeout
        dispatcher.submit("dev-1", CommandAction::TestAlarm).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_commands_do_not_time_out() {
        let (dispatcher, _) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::Start).unwrap();
        assert!(dispatcher.resolve("dev-1", id, AckOutcome::Acked, Some("ok".into())));

        tokio::time::sleep(ACK_TIMEOUT * 2).await;
        let record = dispatcher.status(id).unwrap();
        assert_eq!(record.state, CommandState::Acknowledged);
        assert_eq!(record.detail.as_deref(), Some("ok"));
        assert!(!dispatcher.resolve("dev-1", id, AckOutcome::Nacked, None));
    }

    #[tokio::test]
    async fn nack_fails_the_command() {
        let (dispatcher, _) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::Stop).unwrap();
        assert!(dispatcher.resolve("dev-1", id, AckOutcome::Nacked, Some("sensor busy".into())));

        let record = dispatcher.status(id).unwrap();
        assert_eq!(record.state, CommandState::Failed);
        assert_eq!(record.detail.as_deref(), Some("sensor busy"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn acks_from_other_devices_are_ignored() {
        let (dispatcher, _) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::Reset).unwrap();

        assert!(!dispatcher.resolve("dev-2", id, AckOutcome::Acked, None));
        assert_eq!(dispatcher.status(id).unwrap().state, CommandState::Pending);
        assert_eq!(dispatcher.pending_count(), 1);

        assert!(dispatcher.resolve("dev-1", id, AckOutcome::Acked, None));
        assert_eq!(
            dispatcher.status(id).unwrap().state,
            CommandState::Acknowledged
        );
    }

    #[tokio::test]
    async fn disconnected_broker_fails_immediately() {
        let (dispatcher, publisher) = dispatcher();
        publisher.set_connected(false);

        let command_id = match dispatcher.submit("dev-1", CommandAction::Start) {
            Err(DispatchError::Publish { command_id, source }) => {
                assert_eq!(source, PublishError::NotConnected);
                command_id
            }
            other => panic!("expected publish error, got {:?}", other),
        };
        assert_eq!(
            dispatcher.status(command_id).unwrap().state,
            CommandState::Failed
        );
        assert!(publisher.published().is_empty());

        publisher.set_connected(true);
        dispatcher.submit("dev-1", CommandAction::Start).unwrap();
    }

    #[tokio::test]
    async fn rejected_publish_releases_pair() {
        let (dispatcher, publisher) = dispatcher();
        publisher.set_rejecting(true);
        assert!(matches!(
            dispatcher.submit("dev-1", CommandAction::Reset),
            Err(DispatchError::Publish { .. })
        ));
        assert_eq!(dispatcher.pending_count(), 0);

        publisher.set_rejecting(false);
        assert!(dispatcher.submit("dev-1", CommandAction::Reset).is_ok());
    }

    #[tokio::test]
    async fn unknown_ids_are_reported_or_ignored() {
        let (dispatcher, _) = dispatcher();
        let stranger = Uuid::new_v4();
        assert!(!dispatcher.resolve("dev-1", stranger, AckOutcome::Acked, None));
        assert!(matches!(
            dispatcher.status(stranger),
            Err(DispatchError::NotFound(id)) if id == stranger
        ));
        assert!(matches!(
            dispatcher.submit("dev/1", CommandAction::Start),
            Err(DispatchError::InvalidDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_timeout_leaves_command_pending() {
        let (dispatcher, _) = dispatcher();
        let id = dispatcher.submit("dev-1", CommandAction::Calibrate).unwrap();

        let waited = dispatcher
            .await_resolution(id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(waited.state, CommandState::Pending);

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .await_resolution(id, Duration::from_secs(60))
                    .await
            })
        };
        tokio::task::yield_now().await;
        dispatcher.resolve("dev-1", id, AckOutcome::Acked, None);
        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.state, CommandState::Acknowledged);
    }

    #[tokio::test]
    async fn purge_drops_only_old_terminal_commands() {
        let (dispatcher, _) = dispatcher();
        let done = dispatcher.submit("dev-1", CommandAction::Start).unwrap();
        let pending = dispatcher.submit("dev-2", CommandAction::Start).unwrap();
        dispatcher.resolve("dev-1", done, AckOutcome::Acked, None);

        assert_eq!(dispatcher.purge_terminal(chrono::Duration::hours(1)), 0);
        assert_eq!(dispatcher.purge_terminal(chrono::Duration::seconds(-1)), 1);
        assert!(dispatcher.status(done).is_err());
        assert!(dispatcher.status(pending).is_ok());
    }
}
