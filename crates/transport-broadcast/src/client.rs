use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use transport_bus::Bus;
use transport_core::{
    EventSink, JsonRpcMessage, Transport, TransportError, TransportEvents, TransportKind,
};

use crate::discovery::DiscoveryCoordinator;
use crate::session::SessionChannelTransport;

/// Client transport over the broadcast bus: discovery first, then a private
/// session channel, all behind one event stream.
pub struct BroadcastClientTransport {
    bus: Arc<dyn Bus>,
    coordinator: DiscoveryCoordinator,
    events: Arc<EventSink>,
    session: Mutex<Option<Arc<SessionChannelTransport>>>,
    session_id: Mutex<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl BroadcastClientTransport {
    pub fn new(bus: Arc<dyn Bus>, discovery_channel_name: &str) -> Self {
        let events = Arc::new(EventSink::new("broadcast-client"));
        let coordinator = DiscoveryCoordinator::new(bus.clone(), discovery_channel_name)
            .with_events(events.clone());
        Self {
            bus,
            coordinator,
            events,
            session: Mutex::new(None),
            session_id: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.coordinator = self.coordinator.with_timeout(timeout);
        self
    }

    /// Granted session id; `None` until `start()` succeeds.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    async fn establish(&self) -> Result<(), TransportError> {
        let info = self.coordinator.establish_session().await?;
        let session = Arc::new(SessionChannelTransport::with_sink(
            self.bus.clone(),
            &info.session_channel_name,
            self.events.clone(),
        )?);
        session.start().await?;

        {
            let mut slot = self.session.lock();
            if !self.closed.load(Ordering::Acquire) {
                *slot = Some(session);
                *self.session_id.lock() = Some(info.session_id.clone());
                debug!(
                    target = "transport.session",
                    session_id = %info.session_id,
                    "broadcast client connected"
                );
                return Ok(());
            }
        }
        session.close().await?;
        Err(TransportError::ClosedPendingOpen)
    }
}

#[async_trait]
impl Transport for BroadcastClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::BroadcastClient
    }

    fn take_events(&self) -> Result<TransportEvents, TransportError> {
        self.events.take()
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        if let Err(err) = self.establish().await {
            warn!(target = "transport.session", error = %err, "broadcast client failed to connect");
            self.close().await?;
            return Err(err);
        }
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let session = self.session.lock().clone().ok_or_else(|| {
            TransportError::NotConnected("broadcast client has no session".into())
        })?;
        session.send(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.coordinator.cancel();
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await?;
        }
        self.events.closed();
        Ok(())
    }
}

impl std::fmt::Debug for BroadcastClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastClientTransport")
            .field("coordinator", &self.coordinator)
            .field("session_id", &self.session_id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
