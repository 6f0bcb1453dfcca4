use std::sync::Arc;
use std::time::Duration;

use transport_core::config::{env_truthy, open_timeout_from_env, DISABLE_STUN_ENV};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::util::vnet::net::Net;

/// Label both peers agree on; any other inbound channel is refused.
pub const DATA_CHANNEL_LABEL: &str = "mcp-datachannel";
pub const DEFAULT_NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(100);
pub const PUBLIC_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

/// Configuration shared by the offerer and the answerer.
#[derive(Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment; none by default
    pub ice_servers: Vec<RTCIceServer>,
    /// Label created by the offerer and required by the answerer
    pub data_channel_label: String,
    /// Budget for the data channel to reach `open`
    pub open_timeout: Duration,
    /// Quiet period before acting on `negotiationneeded`
    pub negotiation_debounce: Duration,
    pub ice_timeouts: Option<IceTimeouts>,
    /// Virtual network to bind to instead of the host's interfaces
    pub vnet: Option<Arc<Net>>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            open_timeout: open_timeout_from_env(),
            negotiation_debounce: DEFAULT_NEGOTIATION_DEBOUNCE,
            ice_timeouts: None,
            vnet: None,
        }
    }
}

impl WebRtcConfig {
    pub fn builder() -> WebRtcConfigBuilder {
        WebRtcConfigBuilder::new()
    }

    /// Default configuration plus a public STUN server, unless
    /// `MCP_TRANSPORT_DISABLE_STUN` is set.
    pub fn with_public_stun() -> Self {
        let mut config = Self::default();
        if !env_truthy(DISABLE_STUN_ENV).unwrap_or(false) {
            config.ice_servers.push(RTCIceServer {
                urls: vec![PUBLIC_STUN_URL.to_string()],
                ..Default::default()
            });
        }
        config
    }
}

impl std::fmt::Debug for WebRtcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcConfig")
            .field("ice_servers", &self.ice_servers.len())
            .field("data_channel_label", &self.data_channel_label)
            .field("open_timeout", &self.open_timeout)
            .field("negotiation_debounce", &self.negotiation_debounce)
            .field("ice_timeouts", &self.ice_timeouts)
            .field("vnet", &self.vnet.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct WebRtcConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
    data_channel_label: Option<String>,
    open_timeout: Option<Duration>,
    negotiation_debounce: Option<Duration>,
    ice_timeouts: Option<IceTimeouts>,
    vnet: Option<Arc<Net>>,
}

impl WebRtcConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn negotiation_debounce(mut self, debounce: Duration) -> Self {
        self.negotiation_debounce = Some(debounce);
        self
    }

    pub fn ice_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.ice_timeouts = Some(timeouts);
        self
    }

    pub fn vnet(mut self, net: Arc<Net>) -> Self {
        self.vnet = Some(net);
        self
    }

    pub fn build(self) -> WebRtcConfig {
        let defaults = WebRtcConfig::default();
        WebRtcConfig {
            ice_servers: self.ice_servers,
            data_channel_label: self
                .data_channel_label
                .unwrap_or(defaults.data_channel_label),
            open_timeout: self.open_timeout.unwrap_or(defaults.open_timeout),
            negotiation_debounce: self
                .negotiation_debounce
                .unwrap_or(defaults.negotiation_debounce),
            ice_timeouts: self.ice_timeouts,
            vnet: self.vnet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_the_agreed_label_by_default() {
        let config = WebRtcConfig::builder()
            .open_timeout(Duration::from_millis(50))
            .add_ice_server(vec!["stun:example.org:3478".into()])
            .build();
        assert_eq!(config.data_channel_label, DATA_CHANNEL_LABEL);
        assert_eq!(config.open_timeout, Duration::from_millis(50));
        assert_eq!(config.negotiation_debounce, DEFAULT_NEGOTIATION_DEBOUNCE);
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.vnet.is_none());
    }

    #[test]
    fn default_has_no_ice_servers() {
        assert!(WebRtcConfig::default().ice_servers.is_empty());
    }
}
