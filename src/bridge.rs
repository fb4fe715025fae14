//! # Bridge Lifecycle
//!
//! Wires the broker connection to the reading store, the command dispatcher and
//! the subscriber registry, and owns the single dispatch loop that consumes the
//! ordered inbound stream.
//!
//! ```text
//! Bridge<Configured> ──connect()──► Bridge<Running> ──run_until_shutdown()──► Bridge<Stopping>
//!                                                                                   │
//!                                                  Bridge<Stopped> ◄──shutdown()────┘
//! ```
//!
//! ## Dispatch Loop
//!
//! ```text
//! broker ──► InboundMessage ──► TopicRouter::decode
//!                                  ├─ Telemetry       ──► ReadingStore::upsert ──► SubscriberRegistry
//!                                  ├─ Acknowledgement ──► CommandDispatcher::resolve
//!                                  └─ Malformed       ──► warn! and drop
//! ```
//!
//! Messages are handled strictly in arrival order. Besides messages the loop
//! logs connection state changes and periodically purges old terminal commands.

use crate::config::BridgeConfig;
use crate::dispatcher::CommandDispatcher;
use crate::mqtt::{
    Backoff, ConnectionError, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStatus, InboundMessage, Publisher,
};
use crate::registry::SubscriberRegistry;
use crate::router::{Message, TopicRouter};
use crate::store::ReadingStore;
use chrono::{DateTime, Utc};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Bridge is not running")]
    NotRunning,

    #[error("Bridge task failed: {0}")]
    TaskFailed(String),
}

/// Shared handles used by the dispatch loop and the HTTP surface
#[derive(Clone)]
pub struct BridgeServices {
    pub store: ReadingStore,
    pub dispatcher: CommandDispatcher,
    pub registry: SubscriberRegistry,
    pub router: TopicRouter,
    /// Default time an HTTP caller waits for a command to resolve
    pub request_timeout: Duration,
    publisher: Arc<dyn Publisher>,
    retention: chrono::Duration,
    started_at: DateTime<Utc>,
}

impl BridgeServices {
    pub fn new(config: &BridgeConfig, publisher: Arc<dyn Publisher>) -> Self {
        let router = TopicRouter::new(config.broker.topic_prefix.clone());
        let registry = SubscriberRegistry::new(config.subscribers.clone());
        let store = ReadingStore::new(&config.readings, registry.clone());
        let dispatcher = CommandDispatcher::new(
            &config.commands,
            publisher.clone(),
            router.clone(),
            config.broker.qos(),
        );

        Self {
            store,
            dispatcher,
            registry,
            router,
            request_timeout: Duration::from_millis(config.commands.request_timeout_ms),
            publisher,
            retention: chrono::Duration::seconds(
                config.commands.retention_secs.min(i64::MAX as u64) as i64,
            ),
            started_at: Utc::now(),
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.publisher.status()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Routes one broker publication to the component that owns it
    pub fn handle_message(&self, message: &InboundMessage) {
        match self.router.decode(message) {
            Message::Telemetry(reading) => {
                let device_id = reading.device_id.clone();
                if self.store.upsert(reading) {
                    debug!("Reading from {} applied", device_id);
                }
            }
            Message::Acknowledgement {
                device_id,
                command_id,
                outcome,
                detail,
            } => {
                self.dispatcher
                    .resolve(&device_id, command_id, outcome, detail);
            }
            Message::Malformed(reason) => {
                warn!("Dropping malformed message {}: {}", message, reason);
            }
        }
    }

    fn housekeeping(&self) {
        self.dispatcher.purge_terminal(self.retention);
    }
}

/// Connection-bound parts of a running bridge
pub struct BridgeRuntime {
    services: BridgeServices,
    connection: ConnectionHandle,
    inbound_rx: mpsc::Receiver<InboundMessage>,
}

#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Configured,
    Running,
    Stopping,
    Stopped,
}

#[machine]
pub struct Bridge<S: BridgeState> {
    config: BridgeConfig,
    runtime: Option<BridgeRuntime>,
}

impl<S: BridgeState> Bridge<S> {
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl Bridge<Configured> {
    pub fn configure(config: BridgeConfig) -> Self {
        info!(
            "Configuring bridge for broker {} (prefix {})",
            config.broker.address(),
            config.broker.topic_prefix
        );
        Self::new(config, None)
    }

    /// Connects to the broker and builds the bridge components
    pub async fn connect(mut self) -> Result<Bridge<Running>, BridgeError> {
        let router = TopicRouter::new(self.config.broker.topic_prefix.clone());
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.broker.channel_capacity.max(1));

        let connection = ConnectionManager::new(
            self.config.broker.clone(),
            Backoff::from_config(&self.config.backoff),
            router.subscription_filters(),
        )
        .connect(inbound_tx)
        .await?;

        let services = BridgeServices::new(&self.config, Arc::new(connection.publisher()));
        self.runtime = Some(BridgeRuntime {
            services,
            connection,
            inbound_rx,
        });

        info!("Bridge connected");
        Ok(self.transition())
    }
}

impl Bridge<Running> {
    pub fn services(&self) -> Result<BridgeServices, BridgeError> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.services.clone())
            .ok_or(BridgeError::NotRunning)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.runtime
            .as_ref()
            .map_or(ConnectionState::Disconnected, |runtime| {
                runtime.connection.state()
            })
    }

    /// Runs the dispatch loop until a shutdown signal or the inbound stream ends
    pub async fn run_until_shutdown(
        mut self,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Bridge<Stopping> {
        if let Some(runtime) = self.runtime.as_mut() {
            let state_rx = runtime.connection.publisher().watch_state();
            dispatch_loop(
                &runtime.services,
                &mut runtime.inbound_rx,
                state_rx,
                shutdown_rx,
            )
            .await;
        } else {
            warn!("Bridge has no runtime, nothing to run");
        }

        info!("Bridge stopping");
        self.transition()
    }
}

impl Bridge<Stopping> {
    /// Sends DISCONNECT, stops the event loop and the subscriber workers
    pub async fn shutdown(mut self) -> Bridge<Stopped> {
        if let Some(mut runtime) = self.runtime.take() {
            // Closing first releases an event loop blocked on a full stream
            runtime.inbound_rx.close();
            let dropped = std::iter::from_fn(|| runtime.inbound_rx.try_recv().ok()).count();
            if dropped > 0 {
                debug!("Discarded {} unprocessed inbound messages", dropped);
            }
            runtime.connection.shutdown().await;
            runtime.services.registry.close();
        }

        info!("Bridge stopped");
        self.transition()
    }
}

impl Bridge<Stopped> {}

async fn dispatch_loop(
    services: &BridgeServices,
    inbound_rx: &mut mpsc::Receiver<InboundMessage>,
    mut state_rx: watch::Receiver<ConnectionState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    info!("Dispatch loop started");
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watching_state = true;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Shutdown signal received");
                break;
            }
            message = inbound_rx.recv() => match message {
                Some(message) => services.handle_message(&message),
                None => {
                    warn!("Inbound stream closed");
                    break;
                }
            },
            changed = state_rx.changed(), if watching_state => match changed {
                Ok(()) => info!("Broker connection {:?}", *state_rx.borrow_and_update()),
                Err(_) => watching_state = false,
            },
            _ = housekeeping.tick() => services.housekeeping(),
        }
    }

    info!("Dispatch loop stopped");
}

/// Runs a connected bridge in a background task
pub struct BridgeHandle {
    services: BridgeServices,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    pub fn spawn(bridge: Bridge<Running>) -> Result<Self, BridgeError> {
        let services = bridge.services()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let stopping = bridge.run_until_shutdown(shutdown_rx).await;
            stopping.shutdown().await;
        });

        Ok(Self {
            services,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn services(&self) -> BridgeServices {
        self.services.clone()
    }

    /// Signals the bridge to stop and waits for it
    pub async fn shutdown(&mut self) -> Result<(), BridgeError> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Bridge task already terminated");
            }
        }

        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                error!("Bridge task panicked: {}", e);
                BridgeError::TaskFailed(e.to_string())
            }),
            None => {
                debug!("Bridge already shut down");
                Ok(())
            }
        }
    }
}
