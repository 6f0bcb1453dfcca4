use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::message::JsonRpcMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(JsonRpcMessage),
    Error(TransportError),
    Closed,
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound side of a transport's event stream.
///
/// Events emitted before the receiver is taken are buffered. `Closed` goes
/// out at most once per sink.
pub struct EventSink {
    target: &'static str,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<TransportEvents>>,
    closed: AtomicBool,
}

impl EventSink {
    pub fn new(target: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            target,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn take(&self) -> Result<TransportEvents, TransportError> {
        self.rx.lock().take().ok_or(TransportError::EventsTaken)
    }

    pub fn message(&self, message: JsonRpcMessage) {
        if self.is_closed() {
            debug!(target = "transport.events", sink = self.target, "dropping message after close");
            return;
        }
        let _ = self.tx.send(TransportEvent::Message(message));
    }

    pub fn error(&self, err: TransportError) {
        warn!(target = "transport.events", sink = self.target, error = %err, "transport error");
        let _ = self.tx.send(TransportEvent::Error(err));
    }

    /// Emits `Closed` unless it already went out. Returns whether this call emitted it.
    pub fn closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(target = "transport.events", sink = self.target, "transport closed");
        let _ = self.tx.send(TransportEvent::Closed);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("target", &self.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_goes_out_once() {
        let sink = EventSink::new("test");
        let mut events = sink.take().expect("events");
        assert!(sink.closed());
        assert!(!sink.closed());
        drop(sink);

        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn events_can_only_be_taken_once() {
        let sink = EventSink::new("test");
        let _events = sink.take().expect("first take");
        assert_eq!(sink.take().err(), Some(TransportError::EventsTaken));
    }

    #[tokio::test]
    async fn events_before_take_are_buffered() {
        let sink = EventSink::new("test");
        let message = JsonRpcMessage::notification("ping", None).expect("message");
        sink.message(message.clone());
        sink.error(TransportError::Parse("junk".into()));

        let mut events = sink.take().expect("events");
        assert_eq!(events.recv().await, Some(TransportEvent::Message(message)));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Error(TransportError::Parse("junk".into())))
        );
    }
}
