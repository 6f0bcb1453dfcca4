//! JSON-RPC transports over a named broadcast bus.
//!
//! A client asks for a private channel on a shared discovery channel
//! ([`DiscoveryCoordinator`]), a server grants one ([`DiscoveryListener`]),
//! and from then on both sides talk through a [`SessionChannelTransport`].

use transport_bus::{BusError, MessageErrorKind};
use transport_core::TransportError;

pub mod client;
pub mod discovery;
pub mod envelope;
pub mod listener;
pub mod registry;
pub mod session;

pub use client::BroadcastClientTransport;
pub use discovery::DiscoveryCoordinator;
pub use envelope::{
    session_channel_name, DiscoveryEnvelope, DiscoveryMessage, SessionInfo, DISCOVERY_PROTOCOL,
};
pub use listener::{DiscoveryListener, GrantedSession};
pub use registry::SessionRegistry;
pub use session::SessionChannelTransport;

pub(crate) fn bus_error(err: BusError, channel: &str) -> TransportError {
    match err {
        BusError::Closed => TransportError::ChannelClosed(channel.to_string()),
        BusError::InvalidName(name) => {
            TransportError::Configuration(format!("invalid bus channel name {name:?}"))
        }
        BusError::Transport(reason) => TransportError::Send(reason),
    }
}

pub(crate) fn message_error(kind: MessageErrorKind, channel: &str) -> TransportError {
    match kind {
        MessageErrorKind::InvalidText { len } => TransportError::Parse(format!(
            "{len}-byte message on {channel} is not UTF-8 text"
        )),
        MessageErrorKind::Lagged { skipped } => TransportError::Parse(format!(
            "{skipped} messages lost on {channel}"
        )),
    }
}
