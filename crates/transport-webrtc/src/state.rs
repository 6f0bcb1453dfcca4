use transport_core::TransportError;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    Negotiating,
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl NegotiationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationPhase::New => "new",
            NegotiationPhase::Negotiating => "negotiating",
            NegotiationPhase::Connecting => "connecting",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Failed => "failed",
            NegotiationPhase::Disconnected => "disconnected",
            NegotiationPhase::Closed => "closed",
        }
    }
}

/// Composite view of the ICE agent, the peer connection and the data channel.
///
/// `Closed` is terminal. `Failed` only gives way to `Closed`; `Disconnected`
/// can recover when ICE reconnects. Updates that signal trouble return the
/// error the transport should report; nothing here retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    phase: NegotiationPhase,
    ice: RTCIceConnectionState,
    connection: RTCPeerConnectionState,
    channel: Option<RTCDataChannelState>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            phase: NegotiationPhase::New,
            ice: RTCIceConnectionState::New,
            connection: RTCPeerConnectionState::New,
            channel: None,
        }
    }
}

impl PeerState {
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn ice(&self) -> RTCIceConnectionState {
        self.ice
    }

    pub fn connection(&self) -> RTCPeerConnectionState {
        self.connection
    }

    pub fn channel(&self) -> Option<RTCDataChannelState> {
        self.channel
    }

    fn is_settled(&self) -> bool {
        matches!(self.phase, NegotiationPhase::Closed | NegotiationPhase::Failed)
    }

    fn advance_to_connecting(&mut self) {
        if matches!(self.phase, NegotiationPhase::New | NegotiationPhase::Negotiating) {
            self.phase = NegotiationPhase::Connecting;
        }
    }

    pub fn begin_negotiation(&mut self) {
        if self.phase == NegotiationPhase::New {
            self.phase = NegotiationPhase::Negotiating;
        }
    }

    pub fn on_ice(&mut self, state: RTCIceConnectionState) -> Option<TransportError> {
        if self.phase == NegotiationPhase::Closed {
            return None;
        }
        self.ice = state;
        if self.is_settled() {
            return None;
        }
        match state {
            RTCIceConnectionState::Checking => {
                self.advance_to_connecting();
                None
            }
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if self.phase == NegotiationPhase::Disconnected {
                    self.phase = if self.channel == Some(RTCDataChannelState::Open) {
                        NegotiationPhase::Connected
                    } else {
                        NegotiationPhase::Connecting
                    };
                } else {
                    self.advance_to_connecting();
                }
                None
            }
            RTCIceConnectionState::Disconnected => {
                self.phase = NegotiationPhase::Disconnected;
                Some(TransportError::Connection("ice connection disconnected".into()))
            }
            RTCIceConnectionState::Failed => {
                self.phase = NegotiationPhase::Failed;
                Some(TransportError::Connection("ice connection failed".into()))
            }
            _ => None,
        }
    }

    pub fn on_connection(&mut self, state: RTCPeerConnectionState) -> Option<TransportError> {
        if self.phase == NegotiationPhase::Closed {
            return None;
        }
        self.connection = state;
        if self.is_settled() {
            return None;
        }
        match state {
            RTCPeerConnectionState::Connecting | RTCPeerConnectionState::Connected => {
                self.advance_to_connecting();
                None
            }
            RTCPeerConnectionState::Disconnected => {
                self.phase = NegotiationPhase::Disconnected;
                None
            }
            RTCPeerConnectionState::Failed => {
                self.phase = NegotiationPhase::Failed;
                Some(TransportError::Connection("peer connection failed".into()))
            }
            _ => None,
        }
    }

    pub fn on_channel(&mut self, state: RTCDataChannelState) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        self.channel = Some(state);
        if state == RTCDataChannelState::Open && !self.is_settled() {
            self.phase = NegotiationPhase::Connected;
        }
    }

    pub fn close(&mut self) {
        self.phase = NegotiationPhase::Closed;
        self.ice = RTCIceConnectionState::Closed;
        self.connection = RTCPeerConnectionState::Closed;
        if self.channel.is_some() {
            self.channel = Some(RTCDataChannelState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut state = PeerState::default();
        state.begin_negotiation();
        assert_eq!(state.phase(), NegotiationPhase::Negotiating);
        assert!(state.on_ice(RTCIceConnectionState::Checking).is_none());
        assert_eq!(state.phase(), NegotiationPhase::Connecting);
        assert!(state.on_connection(RTCPeerConnectionState::Connected).is_none());
        state.on_channel(RTCDataChannelState::Open);
        assert_eq!(state.phase(), NegotiationPhase::Connected);
    }

    #[test]
    fn disconnect_can_recover() {
        let mut state = PeerState::default();
        state.on_channel(RTCDataChannelState::Open);
        assert!(state.on_ice(RTCIceConnectionState::Disconnected).is_some());
        assert_eq!(state.phase(), NegotiationPhase::Disconnected);
        assert!(state.on_ice(RTCIceConnectionState::Connected).is_none());
        assert_eq!(state.phase(), NegotiationPhase::Connected);
    }

    #[test]
    fn failure_sticks_until_close() {
        let mut state = PeerState::default();
        assert!(matches!(
            state.on_connection(RTCPeerConnectionState::Failed),
            Some(TransportError::Connection(_))
        ));
        assert!(state.on_ice(RTCIceConnectionState::Connected).is_none());
        state.on_channel(RTCDataChannelState::Open);
        assert_eq!(state.phase(), NegotiationPhase::Failed);

        state.close();
        assert_eq!(state.phase(), NegotiationPhase::Closed);
        assert!(state.on_ice(RTCIceConnectionState::Failed).is_none());
        assert_eq!(state.phase(), NegotiationPhase::Closed);
        assert_eq!(state.channel(), Some(RTCDataChannelState::Closed));
    }
}
