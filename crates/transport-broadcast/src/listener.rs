use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusChannel, BusEvent, BusPoster};
use transport_core::{Transport, TransportError};
use uuid::Uuid;

use crate::envelope::{session_channel_name, DiscoveryEnvelope, DiscoveryMessage, SessionInfo};
use crate::registry::SessionRegistry;
use crate::session::SessionChannelTransport;
use crate::{bus_error, message_error};

/// A session the listener granted. The server-side transport is already
/// started; its event stream has not been taken.
#[derive(Debug, Clone)]
pub struct GrantedSession {
    pub client_id_hint: String,
    pub session: SessionInfo,
    pub transport: Arc<SessionChannelTransport>,
}

/// Server half of the rendezvous: answers session requests on the discovery
/// channel and hands every granted session to [`DiscoveryListener::accept`].
pub struct DiscoveryListener {
    channel_name: String,
    poster: BusPoster,
    task: Mutex<Option<JoinHandle<()>>>,
    granted: tokio::sync::Mutex<mpsc::UnboundedReceiver<GrantedSession>>,
}

impl DiscoveryListener {
    /// Opens the discovery channel and starts granting. Must be called from
    /// within a tokio runtime.
    pub fn bind(
        bus: Arc<dyn Bus>,
        discovery_channel_name: &str,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, TransportError> {
        let channel = BusChannel::open(bus.clone(), discovery_channel_name)
            .map_err(|err| bus_error(err, discovery_channel_name))?;
        let poster = channel.poster();
        let (granted_tx, granted_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(grant_loop(channel, bus, registry, granted_tx));
        info!(
            target = "transport.discovery",
            channel = discovery_channel_name,
            "discovery listener bound"
        );
        Ok(Self {
            channel_name: discovery_channel_name.to_string(),
            poster,
            task: Mutex::new(Some(task)),
            granted: tokio::sync::Mutex::new(granted_rx),
        })
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Next granted session, or `None` once the listener is closed and every
    /// grant has been accepted.
    pub async fn accept(&self) -> Option<GrantedSession> {
        self.granted.lock().await.recv().await
    }

    /// Stops granting. Sessions already granted stay open.
    pub fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            self.poster.close();
            debug!(
                target = "transport.discovery",
                channel = %self.channel_name,
                "discovery listener closed"
            );
        }
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn grant_loop(
    mut channel: BusChannel,
    bus: Arc<dyn Bus>,
    registry: Arc<SessionRegistry>,
    granted_tx: mpsc::UnboundedSender<GrantedSession>,
) {
    let poster = channel.poster();

    while let Some(event) = channel.recv().await {
        let text = match event {
            BusEvent::Message(text) => text,
            BusEvent::MessageError(kind) => {
                warn!(
                    target = "transport.discovery",
                    error = %message_error(kind, poster.name()),
                    "discovery message error"
                );
                continue;
            }
        };
        let hint = match DiscoveryEnvelope::parse(&text) {
            Ok(DiscoveryEnvelope {
                message: DiscoveryMessage::RequestSession { client_id_hint },
                ..
            }) => client_id_hint,
            Ok(_) => continue,
            Err(err) => {
                debug!(target = "transport.discovery", error = %err, "ignoring discovery frame");
                continue;
            }
        };
        if hint.trim().is_empty() {
            debug!(target = "transport.discovery", "ignoring request without client id hint");
            continue;
        }
        if !registry.claim_hint(&hint) {
            debug!(
                target = "transport.discovery",
                client_id_hint = %hint,
                "duplicate session request ignored"
            );
            continue;
        }

        match grant(&bus, &registry, &poster, &hint).await {
            Ok(granted) => {
                if granted_tx.send(granted).is_err() {
                    debug!(target = "transport.discovery", "listener dropped; stopping grant loop");
                    break;
                }
            }
            Err(err) => {
                registry.release_hint(&hint);
                warn!(
                    target = "transport.discovery",
                    client_id_hint = %hint,
                    error = %err,
                    "failed to grant session"
                );
            }
        }
    }
}

async fn grant(
    bus: &Arc<dyn Bus>,
    registry: &SessionRegistry,
    poster: &BusPoster,
    hint: &str,
) -> Result<GrantedSession, TransportError> {
    let session_id = Uuid::new_v4().to_string();
    let channel_name = session_channel_name(&session_id);
    if !registry.reserve(&channel_name) {
        return Err(TransportError::Configuration(format!(
            "session channel {channel_name} was already used"
        )));
    }

    let transport = Arc::new(SessionChannelTransport::new(bus.clone(), &channel_name)?);
    transport.start().await?;

    let session = SessionInfo {
        session_id: session_id.clone(),
        session_channel_name: channel_name,
    };
    let posted = DiscoveryEnvelope::grant(hint, &session)
        .to_wire()
        .and_then(|wire| {
            poster
                .post(&wire)
                .map_err(|err| bus_error(err, poster.name()))
        });
    if let Err(err) = posted {
        transport.close().await?;
        return Err(err);
    }

    registry.insert_granted(&session_id, hint, transport.clone());
    info!(
        target = "transport.discovery",
        session_id = %session_id,
        session_channel = %session.session_channel_name,
        client_id_hint = %hint,
        "session granted"
    );
    Ok(GrantedSession {
        client_id_hint: hint.to_string(),
        session,
        transport,
    })
}
