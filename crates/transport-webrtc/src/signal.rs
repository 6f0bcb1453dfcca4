use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use transport_core::error::to_parse_error;
use transport_core::TransportError;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// ICE candidate in the JSON shape browsers produce with `toJSON()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Out-of-band negotiation message exchanged by the embedding application.
///
/// A `candidate` of `null` marks the end of the remote candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: Option<IceCandidate> },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let signal: Self = serde_json::from_str(text).map_err(to_parse_error)?;
        signal.validate()?;
        Ok(signal)
    }

    pub fn to_wire(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|err| TransportError::Signal(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            SignalMessage::Offer { sdp } | SignalMessage::Answer { sdp }
                if sdp.trim().is_empty() =>
            {
                Err(TransportError::Signal(format!("{} signal without sdp", self.kind())))
            }
            _ => Ok(()),
        }
    }
}

pub type SignalStream = mpsc::UnboundedReceiver<SignalMessage>;
