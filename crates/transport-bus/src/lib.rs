use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 256;

/// Identifies the handle that posted a message so it can skip its own echo.
pub type OriginId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub origin: Option<OriginId>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            origin: None,
            payload,
        }
    }

    pub fn from_origin(topic: impl Into<String>, origin: OriginId, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            origin: Some(origin),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("invalid channel name {0:?}")]
    InvalidName(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, message: BusMessage) -> BusResult<()>;
    /// Hands out an origin id unique on this bus.
    fn allocate_origin(&self) -> OriginId;
    /// Called after a subscriber of `topic` went away.
    fn release(&self, _topic: &str) {}
}

/// In-process hub of named broadcast channels.
///
/// Every subscriber of a name sees every message published on it. Publishing
/// to a name nobody listens on is not an error, matching how a same-origin
/// broadcast channel behaves when no other context has it open. A name is
/// forgotten once its last subscriber is gone.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    next_origin: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Bus> {
        Arc::new(Self::new())
    }

    /// Drops `topic` if nobody is subscribed to it any more.
    fn prune(&self, topic: &str) {
        let mut guard = self.topics.write();
        if guard
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            guard.remove(topic);
            trace!(target = "transport.bus", topic, "topic pruned");
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        // subscribe under the lock so a concurrent prune cannot orphan the receiver
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, message: BusMessage) -> BusResult<()> {
        let sender = self.topics.read().get(&message.topic).cloned();
        // no live receivers; the post simply goes nowhere
        let Some(sender) = sender else {
            return Ok(());
        };
        let topic = message.topic.clone();
        match sender.send(message) {
            Ok(delivered) => {
                trace!(target = "transport.bus", delivered, "published");
            }
            Err(_) => self.prune(&topic),
        }
        Ok(())
    }

    fn allocate_origin(&self) -> OriginId {
        self.next_origin.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn release(&self, topic: &str) {
        self.prune(topic);
    }
}

/// Why an inbound bus message could not be handed over as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageErrorKind {
    /// Payload was not valid UTF-8.
    InvalidText { len: usize },
    /// The receiver fell behind and messages were dropped.
    Lagged { skipped: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(String),
    MessageError(MessageErrorKind),
}

/// A handle on one named channel of a [`Bus`].
///
/// Posts are delivered to every other open handle with the same name, never
/// back to the posting handle.
pub struct BusChannel {
    poster: BusPoster,
    receiver: Option<broadcast::Receiver<BusMessage>>,
}

impl BusChannel {
    pub fn open(bus: Arc<dyn Bus>, name: &str) -> BusResult<Self> {
        if name.trim().is_empty() {
            return Err(BusError::InvalidName(name.to_string()));
        }
        let receiver = bus.subscribe(name);
        let origin = bus.allocate_origin();
        debug!(target = "transport.bus", channel = name, origin, "channel opened");
        Ok(Self {
            poster: BusPoster {
                name: name.to_string(),
                origin,
                bus,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver: Some(receiver),
        })
    }

    pub fn name(&self) -> &str {
        &self.poster.name
    }

    pub fn origin(&self) -> OriginId {
        self.poster.origin
    }

    pub fn poster(&self) -> BusPoster {
        self.poster.clone()
    }

    pub fn post(&self, text: &str) -> BusResult<()> {
        self.poster.post(text)
    }

    pub fn post_bytes(&self, payload: Bytes) -> BusResult<()> {
        self.poster.post_bytes(payload)
    }

    pub fn is_closed(&self) -> bool {
        self.poster.is_closed()
    }

    /// Waits for the next message from another handle.
    ///
    /// Returns `None` once this handle is closed or the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            if self.poster.is_closed() {
                return None;
            }
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(message) => {
                    if self.poster.is_closed() {
                        return None;
                    }
                    if message.origin == Some(self.poster.origin) {
                        continue;
                    }
                    let len = message.payload.len();
                    return Some(match String::from_utf8(message.payload.to_vec()) {
                        Ok(text) => BusEvent::Message(text),
                        Err(_) => BusEvent::MessageError(MessageErrorKind::InvalidText { len }),
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        target = "transport.bus",
                        channel = %self.poster.name,
                        skipped,
                        "bus receiver lagged"
                    );
                    return Some(BusEvent::MessageError(MessageErrorKind::Lagged { skipped }));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn close(&self) {
        self.poster.close();
    }
}

impl Drop for BusChannel {
    fn drop(&mut self) {
        if self.receiver.take().is_some() {
            self.poster.bus.release(&self.poster.name);
        }
    }
}

/// Sending half of a [`BusChannel`], cheap to clone.
#[derive(Clone)]
pub struct BusPoster {
    name: String,
    origin: OriginId,
    bus: Arc<dyn Bus>,
    closed: Arc<AtomicBool>,
}

impl BusPoster {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post(&self, text: &str) -> BusResult<()> {
        self.post_bytes(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn post_bytes(&self, payload: Bytes) -> BusResult<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.bus
            .publish(BusMessage::from_origin(self.name.clone(), self.origin, payload))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                target = "transport.bus",
                channel = %self.name,
                origin = self.origin,
                "channel closed"
            );
        }
    }
}

impl std::fmt::Debug for BusPoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPoster")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish()
    }
}
