use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which establishment step ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    SessionRequest,
    DataChannelOpen,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::SessionRequest => f.write_str("session request"),
            TimeoutPhase::DataChannelOpen => f.write_str("data channel open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport already started")]
    AlreadyStarted,
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("failed to parse message: {0}")]
    Parse(String),
    #[error("signal error: {0}")]
    Signal(String),
    #[error("{phase} timed out after {}ms", .after.as_millis())]
    Timeout { phase: TimeoutPhase, after: Duration },
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("unexpected data channel label {label:?} (expected {expected:?})")]
    UnexpectedChannelLabel { label: String, expected: String },
    #[error("transport closed before it finished opening")]
    ClosedPendingOpen,
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("event stream already taken")]
    EventsTaken,
}

impl TransportError {
    pub fn timeout(phase: TimeoutPhase, after: Duration) -> Self {
        TransportError::Timeout { phase, after }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

pub fn to_parse_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Parse(err.to_string())
}

pub fn to_signal_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Signal(err.to_string())
}

pub fn to_send_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Send(err.to_string())
}
