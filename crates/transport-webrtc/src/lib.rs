//! JSON-RPC over a WebRTC data channel.
//!
//! The offerer creates the channel and the offer; the answerer accepts both.
//! Signals travel through whatever out-of-band path the application provides:
//! drain [`SignalingTransport::take_signals`] on one side and feed each
//! message to [`SignalingTransport::handle_signal`] on the other.

use std::fmt;

use async_trait::async_trait;
use transport_core::{Transport, TransportError};

mod answerer;
mod config;
mod gate;
mod offerer;
mod peer;
mod queue;
mod signal;
mod state;
pub mod vnet;

pub use answerer::WebRtcAnswererTransport;
pub use config::{
    IceTimeouts, WebRtcConfig, WebRtcConfigBuilder, DATA_CHANNEL_LABEL,
    DEFAULT_NEGOTIATION_DEBOUNCE, PUBLIC_STUN_URL,
};
pub use gate::{GateState, OpenGate};
pub use offerer::WebRtcOffererTransport;
pub use queue::PendingSignalQueue;
pub use signal::{IceCandidate, SignalMessage, SignalStream};
pub use state::{NegotiationPhase, PeerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebRtcRole {
    Offerer,
    Answerer,
}

impl WebRtcRole {
    pub fn as_str(self) -> &'static str {
        match self {
            WebRtcRole::Offerer => "offerer",
            WebRtcRole::Answerer => "answerer",
        }
    }
}

impl fmt::Display for WebRtcRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport whose readiness depends on an out-of-band signal exchange.
#[async_trait]
pub trait SignalingTransport: Transport {
    /// Local offer/answer and candidates to forward to the peer. Taken once.
    fn take_signals(&self) -> Result<SignalStream, TransportError>;

    async fn handle_signal(&self, signal: SignalMessage) -> Result<(), TransportError>;
}

pub(crate) fn to_connection_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Connection(err.to_string())
}
