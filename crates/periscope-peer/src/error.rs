use thiserror::Error;

use crate::negotiation::SignalingPhase;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot {action} while {phase}")]
    ProtocolViolation {
        phase: SignalingPhase,
        action: &'static str,
    },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("negotiation already closed")]
    Closed,
    #[error("peer connection error: {0}")]
    Connector(String),
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::MalformedPayload(err.to_string())
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Connector(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
}
