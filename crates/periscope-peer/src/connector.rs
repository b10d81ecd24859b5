//! The peer-connection capability a negotiation instance drives.
//!
//! A connector wraps one underlying peer connection. Calls flow from the
//! negotiator into the connector; asynchronous happenings (gathered local
//! candidates, link status, remote media) flow back through an [`EventSink`].

use async_trait::async_trait;
use periscope_proto::{ConnectionId, IceCandidate, Role, SessionDescription};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::negotiation::LinkStatus;

#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Handle to the remote media once it arrives.
    type Stream: Clone + Send + Sync + 'static;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Who the connector is being built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorContext {
    pub remote: ConnectionId,
    pub local_role: Role,
    pub remote_role: Role,
}

#[async_trait]
pub trait ConnectorFactory: Send + Sync + 'static {
    type Connector: PeerConnector;

    async fn create(
        &self,
        context: ConnectorContext,
        events: EventSink<StreamOf<Self>>,
    ) -> Result<Self::Connector, NegotiationError>;
}

pub type StreamOf<F> = <<F as ConnectorFactory>::Connector as PeerConnector>::Stream;

#[derive(Clone)]
pub enum ConnectorEvent<S> {
    LocalCandidate(IceCandidate),
    LinkStatus(LinkStatus),
    RemoteStream(S),
}

impl<S> std::fmt::Debug for ConnectorEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            ConnectorEvent::LinkStatus(s) => f.debug_tuple("LinkStatus").field(s).finish(),
            ConnectorEvent::RemoteStream(_) => f.write_str("RemoteStream(..)"),
        }
    }
}

/// A connector event tagged with the instance it came from.
#[derive(Debug)]
pub struct TaggedEvent<S> {
    pub remote: ConnectionId,
    pub generation: u64,
    pub event: ConnectorEvent<S>,
}

/// Where a connector reports its events. Each sink is bound to one
/// negotiation instance; events from a replaced instance are ignored by
/// the driver because their generation no longer matches.
pub struct EventSink<S> {
    remote: ConnectionId,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent<S>>,
}

impl<S> Clone for EventSink<S> {
    fn clone(&self) -> Self {
        Self {
            remote: self.remote.clone(),
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }
}

impl<S> EventSink<S> {
    pub fn new(
        remote: ConnectionId,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedEvent<S>>,
    ) -> Self {
        Self {
            remote,
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the driver has gone away.
    pub fn emit(&self, event: ConnectorEvent<S>) -> bool {
        self.tx
            .send(TaggedEvent {
                remote: self.remote.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
