use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use transport_bus::{Bus, BusChannel, BusEvent, BusPoster};
use transport_core::{
    EventSink, JsonRpcMessage, Transport, TransportError, TransportEvents, TransportKind,
};

use crate::{bus_error, message_error};

enum SessionState {
    Idle,
    Open {
        poster: BusPoster,
        pump: JoinHandle<()>,
    },
    Closed,
}

/// JSON-RPC over one dedicated bus channel. Both ends of a session use the
/// same type.
pub struct SessionChannelTransport {
    bus: Arc<dyn Bus>,
    channel_name: String,
    events: Arc<EventSink>,
    state: Mutex<SessionState>,
}

impl SessionChannelTransport {
    pub fn new(bus: Arc<dyn Bus>, channel_name: &str) -> Result<Self, TransportError> {
        Self::with_sink(bus, channel_name, Arc::new(EventSink::new("session")))
    }

    /// Reports through an existing sink, so a composite transport can expose a
    /// single event stream.
    pub fn with_sink(
        bus: Arc<dyn Bus>,
        channel_name: &str,
        events: Arc<EventSink>,
    ) -> Result<Self, TransportError> {
        if channel_name.trim().is_empty() {
            return Err(TransportError::Configuration(
                "session channel name must not be empty".into(),
            ));
        }
        Ok(Self {
            bus,
            channel_name: channel_name.to_string(),
            events,
            state: Mutex::new(SessionState::Idle),
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Open { .. })
    }

    fn poster(&self) -> Result<BusPoster, TransportError> {
        match &*self.state.lock() {
            SessionState::Open { poster, .. } => Ok(poster.clone()),
            SessionState::Idle => Err(TransportError::NotConnected(format!(
                "session channel {} not started",
                self.channel_name
            ))),
            SessionState::Closed => Err(TransportError::NotConnected(format!(
                "session channel {} closed",
                self.channel_name
            ))),
        }
    }
}

#[async_trait]
impl Transport for SessionChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::BroadcastSession
    }

    fn take_events(&self) -> Result<TransportEvents, TransportError> {
        self.events.take()
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !matches!(*state, SessionState::Idle) {
            return Err(TransportError::AlreadyStarted);
        }
        let channel = BusChannel::open(self.bus.clone(), &self.channel_name)
            .map_err(|err| bus_error(err, &self.channel_name))?;
        let poster = channel.poster();
        let pump = tokio::spawn(run_pump(channel, self.events.clone()));
        *state = SessionState::Open { poster, pump };
        debug!(
            target = "transport.session",
            channel = %self.channel_name,
            "session channel started"
        );
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let poster = self.poster()?;
        let wire = message.to_wire()?;
        trace!(
            target = "transport.session",
            channel = %self.channel_name,
            bytes = wire.len(),
            "send"
        );
        poster.post(&wire).map_err(|err| {
            let err = bus_error(err, &self.channel_name);
            self.events.error(err.clone());
            err
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Closed);
        if let SessionState::Open { poster, pump } = previous {
            pump.abort();
            poster.close();
        }
        if self.events.closed() {
            debug!(
                target = "transport.session",
                channel = %self.channel_name,
                "session channel closed"
            );
        }
        Ok(())
    }
}

async fn run_pump(mut channel: BusChannel, events: Arc<EventSink>) {
    while let Some(event) = channel.recv().await {
        match event {
            BusEvent::Message(text) => match JsonRpcMessage::parse(&text) {
                Ok(message) => events.message(message),
                Err(err) => events.error(err),
            },
            BusEvent::MessageError(kind) => events.error(message_error(kind, channel.name())),
        }
    }
    trace!(target = "transport.session", channel = %channel.name(), "pump finished");
}

impl std::fmt::Debug for SessionChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannelTransport")
            .field("channel_name", &self.channel_name)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;
    use transport_core::TransportEvent;

    #[tokio::test]
    async fn lifecycle_errors() {
        let bus = LocalBus::shared();
        let transport = SessionChannelTransport::new(bus, "mcp-session-test").expect("transport");
        let ping = JsonRpcMessage::notification("ping", None).expect("ping");

        assert!(matches!(
            transport.send(&ping).await,
            Err(TransportError::NotConnected(_))
        ));
        transport.start().await.expect("start");
        assert_eq!(transport.start().await, Err(TransportError::AlreadyStarted));
        transport.close().await.expect("close");
        assert_eq!(transport.start().await, Err(TransportError::AlreadyStarted));
        assert!(matches!(
            transport.send(&ping).await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn close_without_start_still_reports_closed_once() {
        let transport = SessionChannelTransport::new(LocalBus::shared(), "mcp-session-idle")
            .expect("transport");
        let mut events = transport.take_events().expect("events");
        transport.close().await.expect("first close");
        transport.close().await.expect("second close");
        drop(transport);
        assert_eq!(events.recv().await, Some(TransportEvent::Closed));
        assert_eq!(events.recv().await, None);
    }

    #[test]
    fn blank_channel_names_are_rejected() {
        let err = SessionChannelTransport::new(LocalBus::shared(), "  ").expect_err("blank");
        assert!(matches!(err, TransportError::Configuration(_)));
    }
}
