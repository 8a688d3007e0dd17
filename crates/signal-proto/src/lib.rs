//! Line-oriented command protocol spoken between the agent and the relay.
//!
//! Inbound frames are plain text commands (`start`, `stop`, `answer:<sdp>`,
//! `ice:<mid>:<index>:<candidate>`). Outbound frames are addressed to a
//! single peer and are either an SDP offer or a trickled ICE candidate.
//! Decoding never fails: anything that cannot be understood becomes
//! [`SignalEvent::Unknown`] carrying the raw text.

use std::fmt;

use thiserror::Error;

const START: &str = "start";
const STOP: &str = "stop";
const ANSWER_PREFIX: &str = "answer:";
const ICE_PREFIX: &str = "ice:";
const CANDIDATE_TOKEN: &str = "candidate";

/// A single ICE candidate as it travels over the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: i32,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(
        sdp_mid: impl Into<String>,
        sdp_mline_index: i32,
        candidate: impl Into<String>,
    ) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.sdp_mid, self.sdp_mline_index, self.candidate
        )
    }
}

/// Decoded inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Start,
    Stop,
    Answer { sdp: String },
    IceCandidate(IceCandidate),
    Unknown { raw: String },
}

impl SignalEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalEvent::Start => "start",
            SignalEvent::Stop => "stop",
            SignalEvent::Answer { .. } => "answer",
            SignalEvent::IceCandidate(_) => "ice",
            SignalEvent::Unknown { .. } => "unknown",
        }
    }
}

/// Frames this endpoint sends to its peer through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    Offer {
        peer_id: String,
        sdp: String,
    },
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
}

/// Why an `ice:` frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    #[error("ice frame has {found} fields, expected 4")]
    FieldCount { found: usize },
    #[error("ice frame has a non-numeric m-line index {value:?}")]
    InvalidMLineIndex { value: String },
    #[error("ice frame body does not start with `candidate`")]
    NotACandidate,
}

/// Strict parse. Unrecognised commands are still `Ok(Unknown)`; only a frame
/// that claims to be an ICE candidate and is broken yields an error.
pub fn parse(raw: &str) -> Result<SignalEvent, MalformedMessage> {
    if raw.starts_with(START) {
        return Ok(SignalEvent::Start);
    }
    if raw.starts_with(STOP) {
        return Ok(SignalEvent::Stop);
    }
    if let Some(sdp) = raw.strip_prefix(ANSWER_PREFIX) {
        return Ok(SignalEvent::Answer {
            sdp: sdp.to_string(),
        });
    }
    if raw.starts_with(ICE_PREFIX) {
        return parse_ice(raw).map(SignalEvent::IceCandidate);
    }
    Ok(SignalEvent::Unknown {
        raw: raw.to_string(),
    })
}

fn parse_ice(raw: &str) -> Result<IceCandidate, MalformedMessage> {
    // The candidate line itself may contain ':' so only the first three
    // delimiters split.
    let fields: Vec<&str> = raw.splitn(4, ':').collect();
    let [_, sdp_mid, index, candidate] = fields.as_slice() else {
        return Err(MalformedMessage::FieldCount {
            found: fields.len(),
        });
    };
    let sdp_mline_index =
        index
            .parse::<i32>()
            .map_err(|_| MalformedMessage::InvalidMLineIndex {
                value: (*index).to_string(),
            })?;
    if !candidate.starts_with(CANDIDATE_TOKEN) {
        return Err(MalformedMessage::NotACandidate);
    }
    Ok(IceCandidate::new(*sdp_mid, sdp_mline_index, *candidate))
}

/// Lenient decode used on the hot path: malformed frames are logged and
/// classified as [`SignalEvent::Unknown`].
pub fn decode(raw: &str) -> SignalEvent {
    match parse(raw) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                error = %err,
                len = raw.len(),
                "discarding malformed frame"
            );
            SignalEvent::Unknown {
                raw: raw.to_string(),
            }
        }
    }
}

pub fn encode(signal: &OutboundSignal) -> String {
    match signal {
        OutboundSignal::Offer { peer_id, sdp } => format!("{peer_id}:offer:{sdp}"),
        OutboundSignal::IceCandidate { peer_id, candidate } => {
            format!("{peer_id}:{ICE_PREFIX}{candidate}")
        }
    }
}
