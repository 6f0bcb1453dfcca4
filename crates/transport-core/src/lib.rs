//! Shared contract for the broadcast-bus and WebRTC transports: the message
//! type they carry, the errors they raise, and the event stream they report
//! through.

use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;

pub use error::{TimeoutPhase, TransportError};
pub use events::{EventSink, TransportEvent, TransportEvents};
pub use message::{JsonRpcKind, JsonRpcMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    BroadcastSession,
    BroadcastClient,
    WebRtcOfferer,
    WebRtcAnswerer,
}

/// What the protocol layer sees of any transport.
///
/// `start` completes only once the transport can carry traffic. Inbound
/// messages, non-fatal errors and the single close notification arrive on the
/// stream returned by `take_events`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn take_events(&self) -> Result<TransportEvents, TransportError>;

    async fn start(&self) -> Result<(), TransportError>;

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError>;

    /// Idempotent; releases every handle and emits `Closed` once.
    async fn close(&self) -> Result<(), TransportError>;
}
