use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use transport_bus::{Bus, BusChannel, BusEvent};
use transport_core::config::session_timeout_from_env;
use transport_core::{EventSink, TimeoutPhase, TransportError};
use uuid::Uuid;

use crate::envelope::{DiscoveryEnvelope, SessionInfo};
use crate::{bus_error, message_error};

/// Client half of the rendezvous: turns the shared discovery channel into a
/// private session channel.
pub struct DiscoveryCoordinator {
    bus: Arc<dyn Bus>,
    channel_name: String,
    timeout: Duration,
    events: Option<Arc<EventSink>>,
    pending: Arc<Mutex<Option<String>>>,
    cancelled: watch::Sender<bool>,
}

/// Clears the pending entry however the request ends, including when the
/// caller drops the future.
struct PendingRequest {
    slot: Arc<Mutex<Option<String>>>,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

impl DiscoveryCoordinator {
    pub fn new(bus: Arc<dyn Bus>, discovery_channel_name: &str) -> Self {
        Self {
            bus,
            channel_name: discovery_channel_name.to_string(),
            timeout: session_timeout_from_env(),
            events: None,
            pending: Arc::new(Mutex::new(None)),
            cancelled: watch::channel(false).0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reports discovery bus corruption on `events` instead of only logging it.
    pub fn with_events(mut self, events: Arc<EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Fails the outstanding request, and every later one, with
    /// `ClosedPendingOpen`.
    pub fn cancel(&self) {
        if !self.cancelled.send_replace(true) {
            debug!(
                target = "transport.discovery",
                channel = %self.channel_name,
                "session requests cancelled"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Posts a session request and waits for the grant addressed to it.
    ///
    /// Only the timeout or [`DiscoveryCoordinator::cancel`] fails the request;
    /// unrelated traffic and corrupt frames on the discovery channel are
    /// skipped. The discovery handle is closed on every exit path.
    pub async fn establish_session(&self) -> Result<SessionInfo, TransportError> {
        if self.is_cancelled() {
            return Err(TransportError::ClosedPendingOpen);
        }
        let hint = Uuid::new_v4().to_string();
        let _pending = {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                return Err(TransportError::AlreadyStarted);
            }
            *slot = Some(hint.clone());
            PendingRequest {
                slot: self.pending.clone(),
            }
        };

        let mut channel = BusChannel::open(self.bus.clone(), &self.channel_name)
            .map_err(|err| bus_error(err, &self.channel_name))?;
        let outcome = self.rendezvous(&mut channel, &hint).await;
        channel.close();
        outcome
    }

    async fn rendezvous(
        &self,
        channel: &mut BusChannel,
        hint: &str,
    ) -> Result<SessionInfo, TransportError> {
        let request = DiscoveryEnvelope::request(hint).to_wire()?;
        channel
            .post(&request)
            .map_err(|err| bus_error(err, &self.channel_name))?;
        debug!(
            target = "transport.discovery",
            channel = %self.channel_name,
            client_id_hint = %hint,
            "session requested"
        );

        let mut cancelled = self.cancelled.subscribe();
        let granted = tokio::time::timeout(self.timeout, self.await_grant(channel, hint));
        let outcome = tokio::select! {
            outcome = granted => outcome,
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                debug!(
                    target = "transport.discovery",
                    client_id_hint = %hint,
                    "session request cancelled before a grant arrived"
                );
                return Err(TransportError::ClosedPendingOpen);
            }
        };
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    target = "transport.discovery",
                    channel = %self.channel_name,
                    client_id_hint = %hint,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "no session grant before timeout"
                );
                Err(TransportError::timeout(TimeoutPhase::SessionRequest, self.timeout))
            }
        }
    }

    async fn await_grant(
        &self,
        channel: &mut BusChannel,
        hint: &str,
    ) -> Result<SessionInfo, TransportError> {
        while let Some(event) = channel.recv().await {
            match event {
                BusEvent::Message(text) => {
                    let envelope = match DiscoveryEnvelope::parse(&text) {
                        Ok(envelope) => envelope,
                        Err(err) => {
                            trace!(
                                target = "transport.discovery",
                                error = %err,
                                "ignoring discovery frame"
                            );
                            continue;
                        }
                    };
                    if let Some(session) = envelope.grant_for(hint) {
                        debug!(
                            target = "transport.discovery",
                            session_id = %session.session_id,
                            session_channel = %session.session_channel_name,
                            "session granted"
                        );
                        return Ok(session);
                    }
                    trace!(
                        target = "transport.discovery",
                        other_hint = %envelope.client_id_hint(),
                        "ignoring discovery traffic for another client"
                    );
                }
                BusEvent::MessageError(kind) => {
                    let err = message_error(kind, &self.channel_name);
                    match &self.events {
                        Some(events) => events.error(err),
                        None => warn!(
                            target = "transport.discovery",
                            error = %err,
                            "discovery message error"
                        ),
                    }
                }
            }
        }
        Err(TransportError::ChannelClosed(self.channel_name.clone()))
    }
}

impl std::fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("channel_name", &self.channel_name)
            .field("timeout", &self.timeout)
            .field("pending", &self.is_pending())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;

    #[tokio::test]
    async fn one_outstanding_request_per_coordinator() {
        let coordinator = Arc::new(
            DiscoveryCoordinator::new(LocalBus::shared(), "mcp-discovery")
                .with_timeout(Duration::from_millis(200)),
        );
        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.establish_session().await }
        });
        while !coordinator.is_pending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            coordinator.establish_session().await,
            Err(TransportError::AlreadyStarted)
        );

        let first = first.await.expect("join");
        assert!(matches!(first, Err(TransportError::Timeout { .. })));
        assert!(!coordinator.is_pending());
    }

    #[tokio::test]
    async fn cancel_ends_the_outstanding_request() {
        let coordinator = Arc::new(
            DiscoveryCoordinator::new(LocalBus::shared(), "mcp-discovery")
                .with_timeout(Duration::from_secs(30)),
        );
        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.establish_session().await }
        });
        while !coordinator.is_pending() {
            tokio::task::yield_now().await;
        }

        coordinator.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("cancel wakes the request")
            .expect("join");
        assert_eq!(outcome, Err(TransportError::ClosedPendingOpen));
        assert!(!coordinator.is_pending());
        assert_eq!(
            coordinator.establish_session().await,
            Err(TransportError::ClosedPendingOpen)
        );
    }
}
