pub mod config;
pub mod host;
pub mod negotiator;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use signal_proto::IceCandidate;
