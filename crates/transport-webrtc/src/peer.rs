use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use transport_core::error::to_send_error;
use transport_core::{EventSink, JsonRpcMessage, TransportError};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::WebRtcConfig;
use crate::gate::OpenGate;
use crate::signal::{IceCandidate, SignalMessage, SignalStream};
use crate::state::{NegotiationPhase, PeerState};
use crate::{to_connection_error, WebRtcRole};

pub(crate) fn build_api(config: &WebRtcConfig) -> Result<API, TransportError> {
    let mut setting = SettingEngine::default();
    if let Some(net) = &config.vnet {
        setting.set_vnet(Some(net.clone()));
    }
    if let Some(timeouts) = config.ice_timeouts {
        setting.set_ice_timeouts(
            Some(timeouts.disconnected),
            Some(timeouts.failed),
            Some(timeouts.keepalive),
        );
    }

    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_connection_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_connection_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Outbound signal stream. Local candidates are held until the description
/// they belong to has gone out.
struct SignalOutbox {
    tx: mpsc::UnboundedSender<SignalMessage>,
    rx: Mutex<Option<SignalStream>>,
    held: Mutex<Option<Vec<IceCandidate>>>,
}

impl SignalOutbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            held: Mutex::new(Some(Vec::new())),
        }
    }

    fn description(&self, signal: SignalMessage) {
        let mut held = self.held.lock();
        let _ = self.tx.send(signal);
        for candidate in held.take().unwrap_or_default() {
            let _ = self.tx.send(SignalMessage::Candidate {
                candidate: Some(candidate),
            });
        }
    }

    fn candidate(&self, candidate: IceCandidate) {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(pending) => pending.push(candidate),
            None => {
                let _ = self.tx.send(SignalMessage::Candidate {
                    candidate: Some(candidate),
                });
            }
        }
    }
}

/// Peer connection, data channel and readiness shared by both roles.
///
/// Callbacks registered with webrtc hold a `Weak` back-reference so a
/// dropped transport is not kept alive by its own listeners.
pub(crate) struct PeerCore {
    pub(crate) role: WebRtcRole,
    pub(crate) config: WebRtcConfig,
    pub(crate) events: Arc<EventSink>,
    pub(crate) gate: OpenGate,
    signals: SignalOutbox,
    state: Mutex<PeerState>,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    closed: AtomicBool,
}

impl PeerCore {
    pub(crate) fn new(role: WebRtcRole, config: WebRtcConfig) -> Arc<Self> {
        Arc::new(Self {
            role,
            config,
            events: Arc::new(EventSink::new(role.as_str())),
            gate: OpenGate::new(),
            signals: SignalOutbox::new(),
            state: Mutex::new(PeerState::default()),
            peer: Mutex::new(None),
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn peer_state(&self) -> PeerState {
        self.state.lock().clone()
    }

    pub(crate) fn begin_negotiation(&self) {
        self.state.lock().begin_negotiation();
    }

    pub(crate) fn take_signals(&self) -> Result<SignalStream, TransportError> {
        self.signals.rx.lock().take().ok_or(TransportError::EventsTaken)
    }

    pub(crate) fn emit_description(&self, signal: SignalMessage) {
        if self.is_closed() {
            return;
        }
        debug!(
            target = "webrtc",
            role = self.role.as_str(),
            signal = signal.kind(),
            "local description ready"
        );
        self.signals.description(signal);
    }

    pub(crate) fn peer(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        self.peer.lock().clone().ok_or_else(|| {
            TransportError::NotConnected(format!("{} has no peer connection", self.role.as_str()))
        })
    }

    /// Creates the peer connection and wires every listener the role needs
    /// before anyone else can see the connection.
    pub(crate) async fn connect(
        self: &Arc<Self>,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let api = build_api(&self.config)?;
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_connection_error)?,
        );
        self.wire_peer(&pc);

        let stored = {
            let mut slot = self.peer.lock();
            if self.is_closed() {
                false
            } else {
                *slot = Some(pc.clone());
                true
            }
        };
        if !stored {
            detach_peer(&pc);
            if let Err(err) = pc.close().await {
                trace!(
                    target = "webrtc",
                    error = %err,
                    "closing orphaned peer connection failed"
                );
            }
            return Err(TransportError::ClosedPendingOpen);
        }
        debug!(target = "webrtc", role = self.role.as_str(), "peer connection created");
        Ok(pc)
    }

    fn wire_peer(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let weak = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let (Some(core), Some(candidate)) = (weak.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => core.signals.candidate(init.into()),
                    Err(err) => core.events.error(TransportError::Signal(err.to_string())),
                }
            })
        }));

        let weak = Arc::downgrade(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(core) = weak.upgrade() {
                core.on_ice_state(state);
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(core) = weak.upgrade() {
                core.on_connection_state(state);
            }
            Box::pin(async {})
        }));

        if self.role == WebRtcRole::Answerer {
            let weak = Arc::downgrade(self);
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(core) = weak.upgrade() {
                        core.accept_channel(channel).await;
                    }
                })
            }));
        }
    }

    /// Adopts an inbound channel if it carries the agreed label; anything
    /// else fails the open gate and is closed.
    async fn accept_channel(self: Arc<Self>, channel: Arc<RTCDataChannel>) {
        let label = channel.label().to_string();
        let expected = &self.config.data_channel_label;
        if &label != expected {
            warn!(
                target = "webrtc",
                role = self.role.as_str(),
                label = %label,
                expected = %expected,
                "rejecting data channel with unexpected label"
            );
            let err = TransportError::UnexpectedChannelLabel {
                label,
                expected: expected.clone(),
            };
            self.gate.fail(err.clone());
            self.events.error(err);
            if let Err(err) = channel.close().await {
                trace!(target = "webrtc", error = %err, "closing rejected data channel failed");
            }
            return;
        }
        debug!(
            target = "webrtc",
            role = self.role.as_str(),
            label = %label,
            "data channel accepted"
        );
        self.attach_channel(channel);
    }

    fn on_ice_state(&self, state: RTCIceConnectionState) {
        let report = self.state.lock().on_ice(state);
        debug!(
            target = "webrtc",
            role = self.role.as_str(),
            state = %state,
            "ice connection state"
        );
        if let Some(err) = report {
            if !self.is_closed() {
                self.events.error(err);
            }
        }
    }

    fn on_connection_state(&self, state: RTCPeerConnectionState) {
        let (report, phase) = {
            let mut peer_state = self.state.lock();
            let report = peer_state.on_connection(state);
            (report, peer_state.phase())
        };
        debug!(
            target = "webrtc",
            role = self.role.as_str(),
            state = %state,
            phase = phase.as_str(),
            "peer connection state"
        );
        if let Some(err) = report {
            if self.is_closed() {
                return;
            }
            if phase == NegotiationPhase::Failed {
                self.gate.fail(err.clone());
            }
            self.events.error(err);
        }
    }

    /// Adopts `channel` as the transport's data channel.
    pub(crate) fn attach_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        {
            let mut slot = self.channel.lock();
            if slot.is_some() {
                warn!(
                    target = "webrtc",
                    role = self.role.as_str(),
                    label = channel.label(),
                    "ignoring additional data channel"
                );
                return;
            }
            *slot = Some(channel.clone());
        }
        self.state.lock().on_channel(channel.ready_state());

        let weak = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.on_channel_open();
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.on_channel_closed();
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        channel.on_error(Box::new(move |err: webrtc::Error| {
            if let Some(core) = weak.upgrade() {
                let err = TransportError::Connection(format!("data channel error: {err}"));
                core.gate.fail(err.clone());
                core.events.error(err);
            }
            Box::pin(async {})
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            if let Some(core) = weak.upgrade() {
                core.on_channel_message(message);
            }
            Box::pin(async {})
        }));
    }

    fn on_channel_open(&self) {
        self.state.lock().on_channel(RTCDataChannelState::Open);
        if self.gate.open() {
            debug!(target = "webrtc", role = self.role.as_str(), "data channel open");
        } else {
            warn!(
                target = "webrtc",
                role = self.role.as_str(),
                gate = ?self.gate.state(),
                "data channel opened after the gate settled"
            );
        }
    }

    fn on_channel_closed(self: Arc<Self>) {
        self.state.lock().on_channel(RTCDataChannelState::Closed);
        if self.is_closed() {
            return;
        }
        debug!(target = "webrtc", role = self.role.as_str(), "data channel closed by peer");
        self.gate.fail(TransportError::ChannelClosed(self.config.data_channel_label.clone()));
        tokio::spawn(async move {
            self.close().await;
        });
    }

    fn on_channel_message(&self, message: DataChannelMessage) {
        if !message.is_string {
            self.events.error(TransportError::Parse(format!(
                "binary data channel frame of {} bytes",
                message.data.len()
            )));
            return;
        }
        let parsed = std::str::from_utf8(&message.data)
            .map_err(|err| TransportError::Parse(err.to_string()))
            .and_then(JsonRpcMessage::parse);
        match parsed {
            Ok(message) => self.events.message(message),
            Err(err) => self.events.error(err),
        }
    }

    pub(crate) async fn wait_open(&self) -> Result<(), TransportError> {
        self.gate.wait().await
    }

    pub(crate) async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let channel = self.channel.lock().clone();
        let channel = match channel {
            Some(channel) if channel.ready_state() == RTCDataChannelState::Open => channel,
            Some(channel) => {
                return Err(TransportError::NotConnected(format!(
                    "data channel is {}",
                    channel.ready_state()
                )))
            }
            None => {
                return Err(TransportError::NotConnected(
                    "data channel not created".into(),
                ))
            }
        };
        let wire = message.to_wire()?;
        trace!(target = "webrtc", role = self.role.as_str(), bytes = wire.len(), "send");
        if let Err(err) = channel.send_text(wire).await {
            let err = to_send_error(err);
            self.events.error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Tears down channel then connection, detaching every listener first.
    /// Returns false if the core was already closed.
    pub(crate) async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.gate.fail(TransportError::ClosedPendingOpen);
        self.state.lock().close();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            detach_channel(&channel);
            if let Err(err) = channel.close().await {
                trace!(
                    target = "webrtc",
                    role = self.role.as_str(),
                    error = %err,
                    "data channel close failed"
                );
            }
        }

        let peer = self.peer.lock().take();
        if let Some(pc) = peer {
            detach_peer(&pc);
            if let Err(err) = pc.close().await {
                trace!(
                    target = "webrtc",
                    role = self.role.as_str(),
                    error = %err,
                    "peer connection close failed"
                );
            }
        }

        self.events.closed();
        debug!(target = "webrtc", role = self.role.as_str(), "transport closed");
        true
    }
}

fn detach_channel(channel: &RTCDataChannel) {
    channel.on_open(Box::new(|| Box::pin(async {})));
    channel.on_close(Box::new(|| Box::pin(async {})));
    channel.on_error(Box::new(|_: webrtc::Error| Box::pin(async {})));
    channel.on_message(Box::new(|_: DataChannelMessage| Box::pin(async {})));
}

pub(crate) fn detach_peer(pc: &RTCPeerConnection) {
    pc.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
    pc.on_ice_connection_state_change(Box::new(|_: RTCIceConnectionState| Box::pin(async {})));
    pc.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
    pc.on_negotiation_needed(Box::new(|| Box::pin(async {})));
    pc.on_data_channel(Box::new(|_: Arc<RTCDataChannel>| Box::pin(async {})));
}

impl std::fmt::Debug for PeerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCore")
            .field("role", &self.role)
            .field("state", &self.peer_state())
            .field("gate", &self.gate.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
