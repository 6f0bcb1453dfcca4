use serde::{Deserialize, Serialize};
use transport_core::error::to_parse_error;
use transport_core::TransportError;

pub const DISCOVERY_PROTOCOL: &str = "mcp-discovery-v1";
pub const SESSION_CHANNEL_PREFIX: &str = "mcp-session-";

pub fn session_channel_name(session_id: &str) -> String {
    format!("{SESSION_CHANNEL_PREFIX}{session_id}")
}

/// Identity of a private session channel handed out by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub session_channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiscoveryMessage {
    RequestSession {
        #[serde(rename = "clientIdHint")]
        client_id_hint: String,
    },
    SessionGranted {
        #[serde(rename = "clientIdHint")]
        client_id_hint: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "sessionChannelName")]
        session_channel_name: String,
    },
}

/// What travels on the discovery bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEnvelope {
    pub protocol: String,
    #[serde(flatten)]
    pub message: DiscoveryMessage,
}

impl DiscoveryEnvelope {
    pub fn request(client_id_hint: &str) -> Self {
        Self {
            protocol: DISCOVERY_PROTOCOL.to_string(),
            message: DiscoveryMessage::RequestSession {
                client_id_hint: client_id_hint.to_string(),
            },
        }
    }

    pub fn grant(client_id_hint: &str, session: &SessionInfo) -> Self {
        Self {
            protocol: DISCOVERY_PROTOCOL.to_string(),
            message: DiscoveryMessage::SessionGranted {
                client_id_hint: client_id_hint.to_string(),
                session_id: session.session_id.clone(),
                session_channel_name: session.session_channel_name.clone(),
            },
        }
    }

    /// Parses a discovery frame. Frames for another protocol are rejected.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let envelope: Self = serde_json::from_str(text).map_err(to_parse_error)?;
        if envelope.protocol != DISCOVERY_PROTOCOL {
            return Err(TransportError::Parse(format!(
                "unexpected discovery protocol {:?}",
                envelope.protocol
            )));
        }
        Ok(envelope)
    }

    pub fn to_wire(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|err| TransportError::Send(err.to_string()))
    }

    pub fn client_id_hint(&self) -> &str {
        match &self.message {
            DiscoveryMessage::RequestSession { client_id_hint }
            | DiscoveryMessage::SessionGranted { client_id_hint, .. } => client_id_hint,
        }
    }

    /// The granted session, if this is a grant addressed to `hint`.
    pub fn grant_for(&self, hint: &str) -> Option<SessionInfo> {
        match &self.message {
            DiscoveryMessage::SessionGranted {
                client_id_hint,
                session_id,
                session_channel_name,
            } if client_id_hint == hint => Some(SessionInfo {
                session_id: session_id.clone(),
                session_channel_name: session_channel_name.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn request_uses_the_wire_names() {
        let wire = DiscoveryEnvelope::request("hint-1").to_wire().expect("wire");
        let value: Value = serde_json::from_str(&wire).expect("json");
        assert_eq!(
            value,
            json!({"protocol":"mcp-discovery-v1","type":"request-session","clientIdHint":"hint-1"})
        );
    }

    #[test]
    fn grant_matches_only_its_hint() {
        let text = r#"{"protocol":"mcp-discovery-v1","type":"session-granted","clientIdHint":"a","sessionId":"s1","sessionChannelName":"mcp-session-s1"}"#;
        let envelope = DiscoveryEnvelope::parse(text).expect("grant");
        assert_eq!(envelope.grant_for("b"), None);
        assert_eq!(
            envelope.grant_for("a"),
            Some(SessionInfo {
                session_id: "s1".into(),
                session_channel_name: "mcp-session-s1".into(),
            })
        );
    }

    #[test]
    fn foreign_traffic_is_rejected() {
        for text in [
            "not json",
            r#"{"protocol":"other-v2","type":"request-session","clientIdHint":"a"}"#,
            r#"{"protocol":"mcp-discovery-v1","type":"say-hello","clientIdHint":"a"}"#,
            r#"{"protocol":"mcp-discovery-v1","type":"session-granted","clientIdHint":"a"}"#,
        ] {
            assert!(DiscoveryEnvelope::parse(text).is_err(), "{text}");
        }
    }
}
