//! Connection supervisor.
//!
//! Owns exactly one live connection+channel per (service, role) and heals it
//! after failure. Reconnects follow a linear backoff (`n × base_interval`
//! before attempt `n`) for at most `max_retries` attempts; past the cap the
//! supervisor parks in `ConnectionState::Failed` until `reconnect()` is
//! called. A successful reconnect starts the next outage from attempt 1.
//!
//! Publishers read the current channel and fail fast while it is absent;
//! consumers watch `channels()` and resume on the next channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{BrokerChannel, BusError, Connector, Result, Role};
use crate::topology::Topology;
use crate::utils::retry::{LinearBuilder, DEFAULT_BASE_INTERVAL, DEFAULT_MAX_RETRIES};

/// Reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: usize,
    pub base_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_interval: DEFAULT_BASE_INTERVAL,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> LinearBuilder {
        LinearBuilder::default()
            .with_base(self.base_interval)
            .with_max_times(self.max_retries)
    }
}

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or shut down.
    Disconnected,
    Connected,
    /// Waiting for (or running) reconnect attempt `attempt`.
    Reconnecting { attempt: usize },
    /// Retry budget exhausted; only `reconnect()` leaves this state.
    Failed,
}

type ChannelSlot = Option<Arc<dyn BrokerChannel>>;

/// Supervises one broker connection for one role of one service.
///
/// Created by the service's composition root and shared by `Arc` with the
/// publisher or consumers that use it.
pub struct ConnectionSupervisor {
    service: String,
    role: Role,
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    topology: Topology,
    channel_tx: watch::Sender<ChannelSlot>,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(
        service: impl Into<String>,
        role: Role,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (channel_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            service: service.into(),
            role,
            url: url.into(),
            connector,
            policy: ReconnectPolicy::default(),
            topology: Topology::new(),
            channel_tx,
            state_tx,
            task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Topology declared on every (re)connect.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Current lifecycle state. A channel that has closed but not yet been
    /// noticed by the supervision task reads as `Disconnected`.
    pub fn state(&self) -> ConnectionState {
        let state = *self.state_tx.borrow();
        if state == ConnectionState::Connected && !self.is_connected() {
            ConnectionState::Disconnected
        } else {
            state
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current channel, if connected and still open.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel_tx
            .borrow()
            .as_ref()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    /// Follow channel replacements (`None` while disconnected).
    pub fn channels(&self) -> watch::Receiver<ChannelSlot> {
        self.channel_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    /// Open the connection, declare the topology and start supervising.
    ///
    /// Fails with `BusError::Connect` when the broker is unreachable and with
    /// `BusError::TopologyConflict` when the declared shape disagrees with
    /// the broker.
    ///
    /// No-op while a live channel is installed.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        let channel = self.open().await?;
        self.install(channel).await;
        Ok(())
    }

    /// Connect, falling back to supervised retries when the broker is down.
    ///
    /// Only fatal errors (topology conflicts) are returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(BusError::Connect(e)) => {
                warn!(
                    service = %self.service,
                    role = %self.role,
                    error = %e,
                    "Broker unreachable at startup, retrying in background"
                );
                self.spawn(None).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// External trigger after the retry budget is exhausted.
    ///
    /// Makes one immediate attempt; on success supervision resumes with a
    /// fresh retry budget. Replaces any retry loop already running.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        info!(service = %self.service, role = %self.role, "Manual reconnect requested");
        self.connect().await
    }

    /// Stop supervising and close the channel.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        let channel = self.channel_tx.send_replace(None);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Error closing broker channel");
            }
        }
        info!(service = %self.service, role = %self.role, "Connection supervisor stopped");
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connector.connect(&self.url, self.role).await?;
        if let Err(e) = self.topology.apply(channel.as_ref()).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    async fn install(self: &Arc<Self>, channel: Arc<dyn BrokerChannel>) {
        self.channel_tx.send_replace(Some(channel.clone()));
        self.state_tx.send_replace(ConnectionState::Connected);
        info!(
            service = %self.service,
            role = %self.role,
            url = %self.url,
            "Connected to broker"
        );
        self.spawn(Some(channel)).await;
    }

    async fn spawn(self: &Arc<Self>, channel: ChannelSlot) {
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.supervise(channel).await });
        if let Some(previous) = self.task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Watch the live channel; on loss, reconnect with backoff.
    async fn supervise(self: Arc<Self>, channel: ChannelSlot) {
        let mut current = channel;
        loop {
            if let Some(channel) = &current {
                channel.closed().await;
                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                warn!(service = %self.service, role = %self.role, "Broker connection lost");
                if let Err(e) = channel.close().await {
                    warn!(service = %self.service, error = %e, "Error closing lost broker connection");
                }
            }

            self.channel_tx.send_replace(None);
            self.state_tx.send_replace(ConnectionState::Disconnected);

            match self.reconnect_with_backoff().await {
                Some(channel) => {
                    self.channel_tx.send_replace(Some(channel.clone()));
                    self.state_tx.send_replace(ConnectionState::Connected);
                    current = Some(channel);
                }
                None => {
                    self.state_tx.send_replace(ConnectionState::Failed);
                    error!(
                        service = %self.service,
                        role = %self.role,
                        max_retries = self.policy.max_retries,
                        "Giving up on broker connection; call reconnect() to retry"
                    );
                    return;
                }
            }
        }
    }

    async fn reconnect_with_backoff(&self) -> Option<Arc<dyn BrokerChannel>> {
        let mut backoff = self.policy.backoff().build();
        let mut attempt = 0;

        while let Some(delay) = backoff.next() {
            attempt += 1;
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt });
            info!(
                service = %self.service,
                role = %self.role,
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to broker after delay"
            );
            tokio::time::sleep(delay).await;

            if self.shutting_down.load(Ordering::SeqCst) {
                return None;
            }

            match self.open().await {
                Ok(channel) => {
                    info!(service = %self.service, role = %self.role, attempt, "Reconnected to broker");
                    return Some(channel);
                }
                Err(e @ BusError::TopologyConflict(_)) => {
                    error!(service = %self.service, error = %e, "Topology conflict on reconnect");
                    return None;
                }
                Err(e) => {
                    warn!(
                        service = %self.service,
                        role = %self.role,
                        attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        None
    }
}
