//! Synchronization Manager.
//!
//! Owns the hub's broker connection. [`SyncManager::start`] connects
//! (retrying transient failures), rehydrates channel state from the
//! journal, subscribes to every channel with a local member and spawns a
//! pump task; the whole sequence is bounded by the start timeout. While
//! running, the pump:
//!
//! - publishes each local change from the hub's outbound queue and
//!   journals it;
//! - keeps the subscription set equal to the hub's local channels as
//!   membership and local connections change;
//! - decodes inbound payloads and applies them to the hub;
//! - once the rejoin grace has passed, drops restored members that never
//!   came back.
//!
//! A failed start leaves the manager stopped and the hub local-only.
//! [`SyncManager::stop`] ends the pump, drops every subscription and
//! releases the connection. Both calls are idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use realm_core::config::GameConfig;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnector};
use crate::envelope::Envelope;
use crate::error::HubError;
use crate::hub::MessagingHub;
use crate::store::ChannelSnapshotStore;

/// Buffer between subscription forwarders and the pump.
const INBOUND_CAPACITY: usize = 1024;

/// Lifecycle of a [`SyncManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No broker connection.
    Stopped,
    /// Connecting and rehydrating.
    Starting,
    /// Connected; changes replicate.
    Running,
    /// Tearing down the connection.
    Stopping,
}

impl SyncState {
    /// Lower-case name, for health reports and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Timing knobs for [`SyncManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Upper bound on the whole start sequence.
    pub start_timeout: Duration,
    /// Connection attempts before giving up.
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub retry_backoff: Duration,
    /// How long members restored from the journal may stay without
    /// reconnecting.
    pub rejoin_grace: Duration,
}

impl SyncOptions {
    /// Options from `infrastructure.sync_start_timeout_ms`, the tick
    /// retry policy and `chat.rejoin_grace_secs`.
    pub const fn from_config(config: &GameConfig) -> Self {
        Self {
            start_timeout: Duration::from_millis(config.infrastructure.sync_start_timeout_ms),
            retry_attempts: config.tick.retry_attempts,
            retry_backoff: Duration::from_millis(config.tick.retry_backoff_ms),
            rejoin_grace: Duration::from_secs(config.chat.rejoin_grace_secs),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&GameConfig::default())
    }
}

struct Running {
    stop: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

/// Starts and stops broker replication for one [`MessagingHub`].
pub struct SyncManager<C: BrokerConnector, J: ChannelSnapshotStore> {
    hub: Arc<MessagingHub>,
    connector: C,
    journal: Arc<J>,
    options: SyncOptions,
    state: watch::Sender<SyncState>,
    running: Mutex<Option<Running>>,
}

impl<C: BrokerConnector, J: ChannelSnapshotStore> SyncManager<C, J> {
    /// A stopped manager.
    pub fn new(hub: Arc<MessagingHub>, connector: C, journal: Arc<J>, options: SyncOptions) -> Self {
        let (state, _) = watch::channel(SyncState::Stopped);
        Self {
            hub,
            connector,
            journal,
            options,
            state,
            running: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Connect, rehydrate and begin replicating.
    ///
    /// A no-op when already running.
    ///
    /// # Errors
    ///
    /// - [`HubError::SyncStartTimeout`] if the broker could not be reached,
    ///   either because the sequence exceeded the start timeout or because
    ///   every connection attempt failed.
    /// - [`HubError::Broker`] if a subscription failed.
    ///
    /// On error the manager is stopped and the hub keeps working locally.
    pub async fn start(&self) -> Result<(), HubError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("sync manager already running");
            return Ok(());
        }
        self.state.send_replace(SyncState::Starting);
        info!(hub = %self.hub.id(), "starting sync manager");

        // Subscribe to local changes first so nothing made during startup is lost.
        let outbound = self.hub.outbound();
        let established = tokio::time::timeout(self.options.start_timeout, self.establish()).await;
        let pump = match established {
            Ok(Ok(pump)) => pump,
            Ok(Err(err)) => {
                warn!(error = %err, "sync manager failed to start, chat is local-only");
                self.state.send_replace(SyncState::Stopped);
                return Err(err);
            }
            Err(_) => {
                let timeout = self.options.start_timeout;
                warn!(?timeout, "broker unreachable, chat is local-only");
                self.state.send_replace(SyncState::Stopped);
                return Err(HubError::SyncStartTimeout(timeout));
            }
        };

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(pump.run(outbound, stop_rx, self.options.rejoin_grace));
        *running = Some(Running { stop, pump: handle });
        self.state.send_replace(SyncState::Running);
        info!(hub = %self.hub.id(), "sync manager running");
        Ok(())
    }

    /// Stop replicating and release the broker connection.
    ///
    /// A no-op when already stopped.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { stop, pump }) = running.take() else {
            debug!("sync manager already stopped");
            return;
        };
        self.state.send_replace(SyncState::Stopping);
        stop.send_replace(true);
        if let Err(err) = pump.await {
            warn!(error = %err, "sync pump ended abnormally");
        }
        self.state.send_replace(SyncState::Stopped);
        info!(hub = %self.hub.id(), "sync manager stopped");
    }

    async fn connect_with_retry(&self) -> Result<C::Broker, HubError> {
        let attempts = self.options.retry_attempts.max(1);
        let mut backoff = self.options.retry_backoff;
        let mut attempt: u32 = 1;
        loop {
            match self.connector.connect().await {
                Ok(broker) => return Ok(broker),
                Err(err) if attempt < attempts => {
                    warn!(attempt, error = %err, "broker connection failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => {
                    warn!(attempts, error = %err, "broker connection attempts exhausted");
                    return Err(HubError::SyncStartTimeout(self.options.start_timeout));
                }
            }
        }
    }

    async fn establish(&self) -> Result<Pump<C::Broker, J>, HubError> {
        let broker = self.connect_with_retry().await?;

        match self.journal.load().await {
            Ok(snapshots) => {
                let restored = self.hub.restore(snapshots, Utc::now());
                info!(channels = restored, "rehydrated channel state");
            }
            Err(err) => warn!(error = %err, "channel journal unavailable, starting empty"),
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut pump = Pump {
            hub: Arc::clone(&self.hub),
            broker,
            journal: Arc::clone(&self.journal),
            subscriptions: BTreeMap::new(),
            inbound_tx,
            inbound_rx,
        };
        pump.reconcile().await?;
        Ok(pump)
    }
}

/// The running half: one broker connection and its subscriptions.
struct Pump<B: Broker, J: ChannelSnapshotStore> {
    hub: Arc<MessagingHub>,
    broker: B,
    journal: Arc<J>,
    subscriptions: BTreeMap<String, JoinHandle<()>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
}

/// Forward one subscription into the pump's inbound queue.
async fn forward(mut stream: BoxStream<'static, Vec<u8>>, inbound: mpsc::Sender<Vec<u8>>) {
    while let Some(payload) = stream.next().await {
        if inbound.send(payload).await.is_err() {
            break;
        }
    }
}

impl<B: Broker, J: ChannelSnapshotStore> Pump<B, J> {
    async fn run(
        mut self,
        mut outbound: broadcast::Receiver<Envelope>,
        mut stop: watch::Receiver<bool>,
        rejoin_grace: Duration,
    ) {
        let hub = Arc::clone(&self.hub);
        let grace = tokio::time::sleep(rejoin_grace);
        tokio::pin!(grace);
        let mut grace_over = false;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                () = &mut grace, if !grace_over => {
                    grace_over = true;
                    // Removals come back through `outbound` and are replicated there.
                    hub.prune_unconfirmed();
                }
                () = hub.local_connections_changed() => self.resubscribe().await,
                change = outbound.recv() => match change {
                    Ok(envelope) => self.publish(&envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync pump fell behind, local changes not replicated");
                        self.resubscribe().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(payload) = self.inbound_rx.recv() => self.apply(&payload),
            }
        }

        for (channel, handle) in std::mem::take(&mut self.subscriptions) {
            handle.abort();
            debug!(channel = %channel, "unsubscribed");
        }
    }

    async fn publish(&mut self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(payload) => {
                if let Err(err) = self.broker.publish(&envelope.channel, payload).await {
                    warn!(channel = %envelope.channel, error = %err, "publish failed");
                }
            }
            Err(err) => warn!(channel = %envelope.channel, error = %err, "envelope encode failed"),
        }

        let history_limit = self.hub.config().history_limit;
        if let Err(err) = self.journal.record(envelope, history_limit).await {
            warn!(channel = %envelope.channel, kind = envelope.kind.name(), error = %err, "journal write failed");
        }

        if envelope.kind.changes_membership() {
            self.resubscribe().await;
        }
    }

    fn apply(&self, payload: &[u8]) {
        match Envelope::decode(payload) {
            Ok(envelope) => {
                let kind = envelope.kind.name();
                if self.hub.apply_remote(envelope) {
                    debug!(kind, "applied remote change");
                }
            }
            Err(err) => warn!(error = %err, "undecodable broker payload dropped"),
        }
    }

    async fn resubscribe(&mut self) {
        if let Err(err) = self.reconcile().await {
            warn!(error = %err, "subscription update failed");
        }
    }

    /// Make the subscription set match the hub's local channels.
    async fn reconcile(&mut self) -> Result<(), HubError> {
        let wanted = self.hub.local_channels();

        let stale: Vec<String> = self
            .subscriptions
            .keys()
            .filter(|c| !wanted.contains(*c))
            .cloned()
            .collect();
        for channel in stale {
            if let Some(handle) = self.subscriptions.remove(&channel) {
                handle.abort();
                debug!(channel = %channel, "unsubscribed");
            }
        }

        for channel in wanted {
            if self.subscriptions.contains_key(&channel) {
                continue;
            }
            let stream = self.broker.subscribe(&channel).await?;
            let handle = tokio::spawn(forward(stream, self.inbound_tx.clone()));
            debug!(channel = %channel, "subscribed");
            self.subscriptions.insert(channel, handle);
        }
        Ok(())
    }
}
