use std::env;
use std::time::Duration;

use crate::session::SessionConfig;
use crate::signaling::{ChannelConfig, ChannelError};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_CLIENT_ID: &str = "777";
pub const DEFAULT_PEER_ID: &str = "1337";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_RECONNECT_MS: u64 = 3_000;

/// One STUN or TURN entry handed to the media negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// WebSocket address of the signaling relay
    pub relay_url: String,
    /// Identity this agent registers with the relay
    pub client_id: String,
    /// The one controller every offer and candidate is addressed to
    pub peer_id: String,
    pub ice_servers: Vec<IceServer>,
    /// Delay before re-dialing a lost relay connection; `None` disables it
    pub reconnect_delay: Option<Duration>,
    /// Whether the host may capture audio
    pub capture_permitted: bool,
}

impl AgentConfig {
    /// Load configuration from `VOICELINK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut ice_servers: Vec<IceServer> = non_empty("VOICELINK_STUN_URLS")
            .map(|urls| {
                urls.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect()
            })
            .unwrap_or_else(|| vec![IceServer::stun(DEFAULT_STUN_URL)]);

        if let Some(url) = non_empty("VOICELINK_TURN_URL") {
            ice_servers.push(IceServer::turn(
                url,
                lookup("VOICELINK_TURN_USERNAME").unwrap_or_default(),
                lookup("VOICELINK_TURN_CREDENTIAL").unwrap_or_default(),
            ));
        }

        let reconnect_ms = non_empty("VOICELINK_RECONNECT_MS")
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RECONNECT_MS);

        let capture_permitted = lookup("VOICELINK_CAPTURE_PERMITTED")
            .map(|value| !(value == "0" || value.eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        Self {
            relay_url: non_empty("VOICELINK_RELAY_URL")
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            client_id: non_empty("VOICELINK_CLIENT_ID")
                .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            peer_id: non_empty("VOICELINK_PEER_ID").unwrap_or_else(|| DEFAULT_PEER_ID.to_string()),
            ice_servers,
            reconnect_delay: reconnect_delay_from_millis(reconnect_ms),
            capture_permitted,
        }
    }

    pub fn channel_config(&self) -> Result<ChannelConfig, ChannelError> {
        ChannelConfig::new(&self.relay_url, self.client_id.clone())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            peer_id: self.peer_id.clone(),
            ice_servers: self.ice_servers.clone(),
        }
    }
}

/// Zero means "do not reconnect".
pub fn reconnect_delay_from_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            peer_id: DEFAULT_PEER_ID.to_string(),
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            reconnect_delay: reconnect_delay_from_millis(DEFAULT_RECONNECT_MS),
            capture_permitted: true,
        }
    }
}
