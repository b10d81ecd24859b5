//! Participant side of periscope.
//!
//! A [`PeerSession`] joins a hub session over a [`SignalingClient`], pairs
//! with the other members by role and runs one [`Negotiator`] per remote
//! through a pluggable [`PeerConnector`].

pub mod connector;
pub mod error;
pub mod negotiation;
pub mod pairing;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod testing;

pub use connector::{
    ConnectorContext, ConnectorEvent, ConnectorFactory, EventSink, PeerConnector, StreamOf,
    TaggedEvent,
};
pub use error::{NegotiationError, SignalingError};
pub use negotiation::{CandidateDisposition, LinkStatus, Negotiator, SignalingPhase};
pub use pairing::{accepts_offer_from, initiative, Initiative};
pub use rtc::{RtcConfig, RtcConnector, RtcConnectorFactory};
pub use session::{
    connect, ConnectedSession, PeerEvent, PeerSession, PeerSessionConfig, PeerSessionHandle,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use signaling::SignalingClient;
