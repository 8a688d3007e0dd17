//! Boundary to the media stack that produces offers and gathers ICE.
//!
//! The session layer only ever talks to a [`MediaNegotiator`] and listens to
//! the [`NegotiatorEvent`] stream handed out alongside it. The production
//! implementation lives in [`rtc`].

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use signal_proto::IceCandidate;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;

pub use rtc::RtcNegotiatorFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer connection is never usable again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    Create(String),
    #[error("failed to create offer: {0}")]
    Offer(String),
    #[error("failed to apply local description: {0}")]
    LocalDescription(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("failed to close peer connection: {0}")]
    Close(String),
}

#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    /// Returns the SDP body of a fresh offer.
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    async fn set_local_description(&self, sdp: String) -> Result<(), NegotiationError>;

    async fn set_remote_description(&self, sdp: String) -> Result<(), NegotiationError>;

    /// `false` when the candidate was rejected; rejection is not fatal.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool;

    async fn close(&self) -> Result<(), NegotiationError>;
}

pub type NegotiatorEvents = mpsc::UnboundedReceiver<NegotiatorEvent>;

/// Builds one negotiator per session.
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn MediaNegotiator>, NegotiatorEvents), NegotiationError>;
}
