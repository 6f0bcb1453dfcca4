use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use transport_core::error::to_signal_error;
use transport_core::{JsonRpcMessage, Transport, TransportError, TransportEvents, TransportKind};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::WebRtcConfig;
use crate::peer::PeerCore;
use crate::queue::PendingSignalQueue;
use crate::signal::{SignalMessage, SignalStream};
use crate::state::PeerState;
use crate::{SignalingTransport, WebRtcRole};

/// Server role: waits for an offer and accepts the peer's data channel.
///
/// The open budget starts at construction, so a peer that never shows up
/// fails [`WebRtcAnswererTransport::await_data_channel_open`] after
/// `open_timeout` even if `start()` is called late.
pub struct WebRtcAnswererTransport {
    core: Arc<PeerCore>,
    signal_lock: tokio::sync::Mutex<()>,
    early_candidates: Mutex<PendingSignalQueue>,
    offer_applied: AtomicBool,
    started: AtomicBool,
    timeout_reported: AtomicBool,
}

impl WebRtcAnswererTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        let core = PeerCore::new(WebRtcRole::Answerer, config);
        core.gate.arm(core.config.open_timeout);
        Self {
            core,
            signal_lock: tokio::sync::Mutex::new(()),
            early_candidates: Mutex::new(PendingSignalQueue::new()),
            offer_applied: AtomicBool::new(false),
            started: AtomicBool::new(false),
            timeout_reported: AtomicBool::new(false),
        }
    }

    pub fn peer_state(&self) -> PeerState {
        self.core.peer_state()
    }

    pub fn is_open(&self) -> bool {
        self.core.gate.is_open()
    }

    /// Remote candidates held back until the offer is applied.
    pub fn pending_candidates(&self) -> usize {
        self.early_candidates.lock().len()
    }

    /// Resolves when the accepted data channel opens. Fails on timeout, on a
    /// channel with the wrong label, or when the transport closes first.
    pub async fn await_data_channel_open(&self) -> Result<(), TransportError> {
        let result = self.core.wait_open().await;
        if let Err(err) = &result {
            if err.is_timeout() && !self.timeout_reported.swap(true, Ordering::AcqRel) {
                self.core.events.error(err.clone());
            }
        }
        result
    }

    async fn apply_offer(&self, sdp: String) -> Result<(), TransportError> {
        let pc = self.core.peer()?;
        self.core.begin_negotiation();
        let offer = RTCSessionDescription::offer(sdp).map_err(to_signal_error)?;
        pc.set_remote_description(offer)
            .await
            .map_err(to_signal_error)?;
        let answer = pc.create_answer(None).await.map_err(to_signal_error)?;
        pc.set_local_description(answer)
            .await
            .map_err(to_signal_error)?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Signal("missing local answer".into()))?;
        self.core
            .emit_description(SignalMessage::Answer { sdp: local.sdp });
        self.offer_applied.store(true, Ordering::Release);

        loop {
            let next = self.early_candidates.lock().pop();
            let Some(signal) = next else {
                break;
            };
            if let Err(err) = self.apply_candidate(signal).await {
                self.core.events.error(err);
            }
        }
        Ok(())
    }

    async fn apply_signal(&self, signal: SignalMessage) -> Result<(), TransportError> {
        signal.validate()?;
        match signal {
            SignalMessage::Offer { sdp } => self.apply_offer(sdp).await,
            candidate @ SignalMessage::Candidate { .. } => {
                if self.offer_applied.load(Ordering::Acquire) {
                    self.apply_candidate(candidate).await
                } else {
                    trace!(target = "webrtc", role = "answerer", "candidate before offer; queued");
                    self.early_candidates.lock().push(candidate);
                    Ok(())
                }
            }
            SignalMessage::Answer { .. } => {
                warn!(
                    target = "webrtc",
                    role = "answerer",
                    "ignoring answer sent to the answering side"
                );
                Ok(())
            }
        }
    }

    async fn apply_candidate(&self, signal: SignalMessage) -> Result<(), TransportError> {
        match signal {
            SignalMessage::Candidate {
                candidate: Some(candidate),
            } => self
                .core
                .peer()?
                .add_ice_candidate(candidate.into())
                .await
                .map_err(to_signal_error),
            _ => {
                trace!(target = "webrtc", role = "answerer", "remote candidates complete");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for WebRtcAnswererTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtcAnswerer
    }

    fn take_events(&self) -> Result<TransportEvents, TransportError> {
        self.core.events.take()
    }

    /// Creates the peer connection and returns without waiting for a peer.
    async fn start(&self) -> Result<(), TransportError> {
        if self.core.is_closed() || self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        // signals racing with start wait here until the connection is wired
        let connected = {
            let _guard = self.signal_lock.lock().await;
            self.core.connect().await
        };
        match connected {
            Ok(_) => {
                debug!(target = "webrtc", role = "answerer", "waiting for offer");
                Ok(())
            }
            Err(err) => {
                if err != TransportError::ClosedPendingOpen {
                    self.core.events.error(err.clone());
                }
                self.close().await?;
                Err(err)
            }
        }
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        self.core.send(message).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.early_candidates.lock().clear();
        self.core.close().await;
        Ok(())
    }
}

#[async_trait]
impl SignalingTransport for WebRtcAnswererTransport {
    fn take_signals(&self) -> Result<SignalStream, TransportError> {
        self.core.take_signals()
    }

    /// Failures past the lifecycle checks are returned and also reported on
    /// the event stream.
    async fn handle_signal(&self, signal: SignalMessage) -> Result<(), TransportError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected("answerer not started".into()));
        }
        if self.core.is_closed() {
            return Err(TransportError::NotConnected("answerer closed".into()));
        }

        let _guard = self.signal_lock.lock().await;
        let result = self.apply_signal(signal).await;
        if let Err(err) = &result {
            if !self.core.is_closed() {
                self.core.events.error(err.clone());
            }
        }
        result
    }
}

impl std::fmt::Debug for WebRtcAnswererTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcAnswererTransport")
            .field("core", &self.core)
            .field("offer_applied", &self.offer_applied.load(Ordering::Acquire))
            .finish()
    }
}
