use std::sync::Arc;

use async_trait::async_trait;
use signal_proto::IceCandidate;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectionState, MediaNegotiator, NegotiationError, NegotiatorEvent, NegotiatorEvents,
    NegotiatorFactory,
};
use crate::config::IceServer;

const AUDIO_TRACK_ID: &str = "ARDAMSa0";
const AUDIO_STREAM_ID: &str = "voicelink";
const AUDIO_CLOCK_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;

/// Builds peer connections carrying one outbound opus track.
#[derive(Debug, Default, Clone)]
pub struct RtcNegotiatorFactory;

impl RtcNegotiatorFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn MediaNegotiator>, NegotiatorEvents), NegotiationError> {
        let (negotiator, events) = RtcNegotiator::new(ice_servers).await?;
        Ok((Arc::new(negotiator), events))
    }
}

pub struct RtcNegotiator {
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcNegotiator {
    pub async fn new(ice_servers: &[IceServer]) -> Result<(Self, NegotiatorEvents), NegotiationError> {
        let create_err = |err: webrtc::Error| NegotiationError::Create(err.to_string());

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(create_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(create_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(create_err)?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                ..Default::default()
            },
            AUDIO_TRACK_ID.to_owned(),
            AUDIO_STREAM_ID.to_owned(),
        ));
        let sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(create_err)?;
        // RTCP has to be read for the interceptors to make progress.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "negotiator", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::new(
                            init.sdp_mid.unwrap_or_default(),
                            init.sdp_mline_index.map_or(0, i32::from),
                            init.candidate,
                        );
                        tracing::debug!(
                            target = "negotiator",
                            candidate = %candidate.candidate,
                            "local ice candidate"
                        );
                        let _ = candidate_tx.send(NegotiatorEvent::LocalCandidate(candidate));
                    }
                    Err(err) => {
                        tracing::warn!(target = "negotiator", error = %err, "unserialisable ice candidate");
                    }
                }
            })
        }));

        let state_tx = events_tx;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let state_tx = state_tx.clone();
                Box::pin(async move {
                    let state = map_connection_state(state);
                    tracing::info!(target = "negotiator", state = ?state, "peer connection state changed");
                    let _ = state_tx.send(NegotiatorEvent::ConnectionState(state));
                })
            },
        ));

        tracing::debug!(
            target = "negotiator",
            ice_servers = ice_servers.len(),
            "peer connection created"
        );
        Ok((Self { peer_connection }, events_rx))
    }
}

#[async_trait]
impl MediaNegotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|err| NegotiationError::Offer(err.to_string()))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: String) -> Result<(), NegotiationError> {
        let local_err = |err: webrtc::Error| NegotiationError::LocalDescription(err.to_string());
        let offer = RTCSessionDescription::offer(sdp).map_err(local_err)?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(local_err)
    }

    async fn set_remote_description(&self, sdp: String) -> Result<(), NegotiationError> {
        let remote_err = |err: webrtc::Error| NegotiationError::RemoteDescription(err.to_string());
        let answer = RTCSessionDescription::answer(sdp).map_err(remote_err)?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(remote_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> bool {
        let Ok(sdp_mline_index) = u16::try_from(candidate.sdp_mline_index) else {
            tracing::warn!(
                target = "negotiator",
                index = candidate.sdp_mline_index,
                candidate = %candidate,
                "remote ice candidate has an out-of-range m-line index"
            );
            return false;
        };
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(sdp_mline_index),
            username_fragment: None,
        };
        match self.peer_connection.add_ice_candidate(init).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    target = "negotiator",
                    error = %err,
                    candidate = %candidate,
                    "remote ice candidate rejected"
                );
                false
            }
        }
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.peer_connection
            .close()
            .await
            .map_err(|err| NegotiationError::Close(err.to_string()))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}
