//! Publish/subscribe broker abstraction.
//!
//! Each chat channel maps to one broker subject. [`NatsBroker`] is the
//! production implementation; [`LocalBus`] is an in-process bus shared by
//! several hubs in one process, used by tests and single-node setups.
//!
//! # Subject Convention
//!
//! - `global` → `chat.global`
//! - `alliance:{id}` → `chat.alliance.{id}`
//! - `world:{id}` → `chat.world.{id}`
//! - `player:{id}` → `chat.player.{id}`
//!
//! A subscription ends when its stream is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::HubError;

/// Per-subject buffer of the in-process bus.
const LOCAL_SUBJECT_CAPACITY: usize = 256;

/// Broker subject carrying a chat channel.
pub fn subject_for(channel: &str) -> String {
    format!("chat.{}", channel.replace(':', "."))
}

/// A connected broker.
pub trait Broker: Send + Sync + 'static {
    /// Publish one payload on the channel's subject.
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), HubError>> + Send;

    /// Subscribe to the channel's subject. Dropping the stream unsubscribes.
    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<BoxStream<'static, Vec<u8>>, HubError>> + Send;
}

/// Establishes broker connections for the sync manager.
pub trait BrokerConnector: Send + Sync + 'static {
    /// The connection type produced.
    type Broker: Broker;

    /// Open a connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Broker, HubError>> + Send;
}

// =============================================================================
// NATS
// =============================================================================

/// Connects to a NATS server.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    /// A connector for the server at `url` (e.g. `nats://localhost:4222`).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl BrokerConnector for NatsConnector {
    type Broker = NatsBroker;

    async fn connect(&self) -> Result<NatsBroker, HubError> {
        info!(url = %self.url, "connecting to NATS server");
        let client = async_nats::connect(self.url.as_str())
            .await
            .map_err(|e| HubError::Broker(format!("failed to connect to {}: {e}", self.url)))?;
        info!("NATS connection established");
        Ok(NatsBroker { client })
    }
}

/// A live NATS connection. Dropping it closes the connection once
/// pending publishes are flushed by the client.
pub struct NatsBroker {
    client: async_nats::Client,
}

impl Broker for NatsBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), HubError> {
        let subject = subject_for(channel);
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| HubError::Broker(format!("failed to publish to {subject}: {e}")))
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, HubError> {
        let subject = subject_for(channel);
        debug!(subject = %subject, "subscribing");
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| HubError::Broker(format!("failed to subscribe to {subject}: {e}")))?;
        Ok(subscriber.map(|msg| msg.payload.to_vec()).boxed())
    }
}

// =============================================================================
// In-process bus
// =============================================================================

#[derive(Debug, Default)]
struct BusInner {
    subjects: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    unreachable: AtomicBool,
    stalled: AtomicBool,
    connects: AtomicU32,
}

/// An in-process broker shared by every hub holding a clone.
///
/// Delivery is at-most-once per subscriber; a subscriber that falls more
/// than the subject buffer behind skips ahead.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// A fresh bus with no subjects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make new connections fail immediately (`true`) or succeed (`false`).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make new connections hang forever (`true`) or resolve (`false`).
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Connection attempts made so far.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Vec<u8>> {
        let mut subjects = self
            .inner
            .subjects
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subjects
            .entry(subject.to_owned())
            .or_insert_with(|| broadcast::channel(LOCAL_SUBJECT_CAPACITY).0)
            .clone()
    }
}

impl BrokerConnector for LocalBus {
    type Broker = LocalBroker;

    async fn connect(&self) -> Result<LocalBroker, HubError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.inner.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(HubError::Broker(String::from("local bus unreachable")));
        }
        Ok(LocalBroker { bus: self.clone() })
    }
}

/// A connection to a [`LocalBus`].
#[derive(Debug)]
pub struct LocalBroker {
    bus: LocalBus,
}

impl Broker for LocalBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), HubError> {
        let subject = subject_for(channel);
        if self.bus.sender(&subject).send(payload).is_err() {
            debug!(subject = %subject, "no local subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>, HubError> {
        let subject = subject_for(channel);
        let receiver = self.bus.sender(&subject).subscribe();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let subject = subject.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(subject = %subject, skipped, "local subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
