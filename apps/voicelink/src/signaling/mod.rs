//! Persistent command channel to the signaling relay.
//!
//! One [`SignalingChannel`] owns at most one live WebSocket at a time. A
//! writer task drains the outbound queue into the socket and a reader task
//! forwards inbound text frames, in arrival order, to whoever took the
//! inbound receiver. Each successful connect registers with the relay by
//! sending the client id as the first frame.

mod channel;

pub use channel::SignalingChannel;

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// What the channel hands to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    /// The relay went away without us asking. Emitted once per connection.
    Lost { reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("signaling channel closed")]
    Closed,
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// The only outbound surface the session layer sees.
pub trait SignalSink: Send + Sync {
    /// Queue a text frame. Best-effort and at-most-once: `Ok` means queued,
    /// not delivered.
    fn send(&self, frame: String) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    pub client_id: String,
}

impl ChannelConfig {
    pub fn new(url: &str, client_id: impl Into<String>) -> Result<Self, ChannelError> {
        let parsed = Url::parse(url).map_err(|err| ChannelError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ChannelError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(Self {
            url: parsed,
            client_id: client_id.into(),
        })
    }
}
