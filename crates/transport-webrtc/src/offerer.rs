use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use transport_core::error::to_signal_error;
use transport_core::{JsonRpcMessage, Transport, TransportError, TransportEvents, TransportKind};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::WebRtcConfig;
use crate::peer::PeerCore;
use crate::queue::PendingSignalQueue;
use crate::signal::{SignalMessage, SignalStream};
use crate::state::PeerState;
use crate::{to_connection_error, SignalingTransport, WebRtcRole};

struct OffererInner {
    core: Arc<PeerCore>,
    /// Serializes every change to the remote/local descriptions.
    signal_lock: tokio::sync::Mutex<()>,
    pending: Mutex<PendingSignalQueue>,
    /// Set once the first offer is in place and the backlog is drained.
    signals_ready: AtomicBool,
    started: AtomicBool,
    negotiation_generation: AtomicU64,
}

/// Client role: creates the data channel and the offer.
pub struct WebRtcOffererTransport {
    inner: Arc<OffererInner>,
}

impl WebRtcOffererTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            inner: Arc::new(OffererInner {
                core: PeerCore::new(WebRtcRole::Offerer, config),
                signal_lock: tokio::sync::Mutex::new(()),
                pending: Mutex::new(PendingSignalQueue::new()),
                signals_ready: AtomicBool::new(false),
                started: AtomicBool::new(false),
                negotiation_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn peer_state(&self) -> PeerState {
        self.inner.core.peer_state()
    }

    pub fn pending_signals(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_open(&self) -> bool {
        self.inner.core.gate.is_open()
    }
}

impl OffererInner {
    async fn establish(self: &Arc<Self>) -> Result<(), TransportError> {
        let pc = self.core.connect().await?;
        self.wire_negotiation(&pc);

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = pc
            .create_data_channel(&self.core.config.data_channel_label, Some(init))
            .await
            .map_err(to_connection_error)?;
        self.core.attach_channel(channel);
        self.core.begin_negotiation();

        {
            let _guard = self.signal_lock.lock().await;
            self.send_offer(&pc).await?;
        }
        self.replay_pending().await;

        debug!(target = "webrtc", role = "offerer", "offer sent; waiting for data channel");
        self.core.wait_open().await
    }

    async fn send_offer(&self, pc: &RTCPeerConnection) -> Result<(), TransportError> {
        let offer = pc.create_offer(None).await.map_err(to_signal_error)?;
        pc.set_local_description(offer)
            .await
            .map_err(to_signal_error)?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Signal("missing local offer".into()))?;
        self.core.emit_description(SignalMessage::Offer { sdp: local.sdp });
        Ok(())
    }

    /// Applies queued signals one at a time under the signal lock; the queue
    /// only stops filling once it has been seen empty.
    async fn replay_pending(&self) {
        loop {
            let _guard = self.signal_lock.lock().await;
            let next = self.pending.lock().pop();
            let Some(signal) = next else {
                self.signals_ready.store(true, Ordering::Release);
                return;
            };
            trace!(
                target = "webrtc",
                role = "offerer",
                signal = signal.kind(),
                "replaying queued signal"
            );
            if let Err(err) = self.apply(signal).await {
                self.core.events.error(err);
            }
        }
    }

    async fn apply(&self, signal: SignalMessage) -> Result<(), TransportError> {
        signal.validate()?;
        let pc = self.core.peer()?;
        match signal {
            SignalMessage::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp).map_err(to_signal_error)?;
                pc.set_remote_description(answer)
                    .await
                    .map_err(to_signal_error)?;
                debug!(target = "webrtc", role = "offerer", "remote answer applied");
            }
            SignalMessage::Candidate {
                candidate: Some(candidate),
            } => {
                pc.add_ice_candidate(candidate.into())
                    .await
                    .map_err(to_signal_error)?;
            }
            SignalMessage::Candidate { candidate: None } => {
                trace!(target = "webrtc", role = "offerer", "remote candidates complete");
            }
            SignalMessage::Offer { .. } => {
                warn!(
                    target = "webrtc",
                    role = "offerer",
                    "ignoring offer sent to the offering side"
                );
            }
        }
        Ok(())
    }

    fn wire_negotiation(self: &Arc<Self>, pc: &RTCPeerConnection) {
        let weak = Arc::downgrade(self);
        pc.on_negotiation_needed(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.schedule_renegotiation();
            }
            Box::pin(async {})
        }));
    }

    fn ready_to_renegotiate(&self) -> bool {
        if self.core.is_closed() || !self.signals_ready.load(Ordering::Acquire) {
            return false;
        }
        self.core
            .peer()
            .map(|pc| pc.signaling_state() == RTCSignalingState::Stable)
            .unwrap_or(false)
    }

    /// Debounced `negotiationneeded`: only the last event in a burst acts.
    fn schedule_renegotiation(self: &Arc<Self>) {
        if !self.ready_to_renegotiate() {
            trace!(
                target = "webrtc",
                role = "offerer",
                "negotiation needed before initial offer settled; skipped"
            );
            return;
        }
        let generation = self.negotiation_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let debounce = self.core.config.negotiation_debounce;
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.negotiation_generation.load(Ordering::Acquire) != generation {
                return;
            }
            let _guard = inner.signal_lock.lock().await;
            if !inner.ready_to_renegotiate() {
                debug!(
                    target = "webrtc",
                    role = "offerer",
                    "renegotiation abandoned after debounce"
                );
                return;
            }
            let result = match inner.core.peer() {
                Ok(pc) => inner.send_offer(&pc).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                inner.core.events.error(err);
            }
        });
    }
}

#[async_trait]
impl Transport for WebRtcOffererTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtcOfferer
    }

    fn take_events(&self) -> Result<TransportEvents, TransportError> {
        self.inner.core.events.take()
    }

    /// Returns once the data channel is open, or fails and closes.
    async fn start(&self) -> Result<(), TransportError> {
        if self.inner.core.is_closed() || self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        self.inner.core.gate.arm(self.inner.core.config.open_timeout);

        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err != TransportError::ClosedPendingOpen {
                    self.inner.core.events.error(err.clone());
                }
                warn!(target = "webrtc", role = "offerer", error = %err, "offerer failed to start");
                self.close().await?;
                Err(err)
            }
        }
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        self.inner.core.send(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .negotiation_generation
            .fetch_add(1, Ordering::AcqRel);
        self.inner.pending.lock().clear();
        self.inner.core.close().await;
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for WebRtcOffererTransport {
    fn take_signals(&self) -> Result<SignalStream, TransportError> {
        self.inner.core.take_signals()
    }

    /// Applies an answer or candidate; anything arriving before the local
    /// offer is in place is queued and replayed in order. Failures to apply
    /// are returned and also reported on the event stream.
    async fn handle_signal(&self, signal: SignalMessage) -> Result<(), TransportError> {
        if self.inner.core.is_closed() {
            return Err(TransportError::NotConnected("offerer closed".into()));
        }
        let _guard = self.inner.signal_lock.lock().await;
        if !self.inner.signals_ready.load(Ordering::Acquire) {
            trace!(
                target = "webrtc",
                role = "offerer",
                signal = signal.kind(),
                "queueing signal until offer is set"
            );
            self.inner.pending.lock().push(signal);
            return Ok(());
        }
        let result = self.inner.apply(signal).await;
        if let Err(err) = &result {
            if !self.inner.core.is_closed() {
                self.inner.core.events.error(err.clone());
            }
        }
        result
    }
}

impl std::fmt::Debug for WebRtcOffererTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcOffererTransport")
            .field("core", &self.inner.core)
            .field("pending_signals", &self.pending_signals())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::answerer::WebRtcAnswererTransport;
    use crate::config::IceTimeouts;
    use crate::vnet::VirtualNetwork;

    fn vnet_config(net: Arc<webrtc::util::vnet::net::Net>) -> WebRtcConfig {
        WebRtcConfig::builder()
            .vnet(net)
            .ice_timeouts(IceTimeouts {
                disconnected: Duration::from_secs(1),
                failed: Duration::from_secs(1),
                keepalive: Duration::from_millis(200),
            })
            .negotiation_debounce(Duration::from_millis(50))
            .build()
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn negotiation_needed_before_the_first_offer_is_skipped() {
        let offerer = WebRtcOffererTransport::new(
            WebRtcConfig::builder()
                .negotiation_debounce(Duration::from_millis(20))
                .build(),
        );
        let mut signals = offerer.take_signals().expect("signals");

        offerer.inner.schedule_renegotiation();
        assert_eq!(offerer.inner.negotiation_generation.load(Ordering::Acquire), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(signals.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn a_burst_of_negotiation_needed_sends_one_offer() {
        let network = VirtualNetwork::pair().await.expect("virtual network");
        let offerer = Arc::new(WebRtcOffererTransport::new(vnet_config(network.offerer_net())));
        let answerer = Arc::new(WebRtcAnswererTransport::new(vnet_config(
            network.answerer_net(),
        )));
        answerer.start().await.expect("answerer start");

        let offers = Arc::new(AtomicUsize::new(0));
        let mut offer_signals = offerer.take_signals().expect("offer signals");
        let to_answerer = tokio::spawn({
            let answerer = answerer.clone();
            let offers = offers.clone();
            async move {
                while let Some(signal) = offer_signals.recv().await {
                    if matches!(signal, SignalMessage::Offer { .. }) {
                        offers.fetch_add(1, Ordering::AcqRel);
                    }
                    let _ = answerer.handle_signal(signal).await;
                }
            }
        });
        let mut answer_signals = answerer.take_signals().expect("answer signals");
        let to_offerer = tokio::spawn({
            let offerer = offerer.clone();
            async move {
                while let Some(signal) = answer_signals.recv().await {
                    let _ = offerer.handle_signal(signal).await;
                }
            }
        });

        offerer.start().await.expect("offerer open");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = offers.load(Ordering::Acquire);
        assert!(settled >= 1);

        for _ in 0..5 {
            offerer.inner.schedule_renegotiation();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(offers.load(Ordering::Acquire), settled + 1);

        offerer.close().await.expect("offerer close");
        answerer.close().await.expect("answerer close");
        to_answerer.abort();
        to_offerer.abort();
        let _ = network.shutdown().await;
    }
}
