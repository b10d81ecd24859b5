//! Per-remote negotiation state machine.
//!
//! One [`Negotiator`] exists per remote connection. It tracks the signaling
//! phase (who owes whom a description), the link status reported by the
//! connector, and queues remote candidates that arrive before the remote
//! description has been applied.

use std::collections::VecDeque;
use std::fmt;

use periscope_proto::{ConnectionId, IceCandidate, Role, SdpKind, SessionDescription};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connector::PeerConnector;
use crate::error::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    OfferSent,
    OfferReceived,
}

impl fmt::Display for SignalingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalingPhase::Stable => "stable",
            SignalingPhase::OfferSent => "offer-sent-awaiting-answer",
            SignalingPhase::OfferReceived => "offer-received-awaiting-local-answer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkStatus {
    /// `Closed` is terminal, `Failed` only moves to `Closed`, and nothing
    /// returns to `New`. Skipping intermediate states is allowed.
    pub fn can_transition_to(self, next: LinkStatus) -> bool {
        match (self, next) {
            (current, next) if current == next => false,
            (LinkStatus::Closed, _) => false,
            (LinkStatus::Failed, next) => next == LinkStatus::Closed,
            (_, LinkStatus::New) => false,
            _ => true,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LinkStatus::Closed)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkStatus::New => "new",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Failed => "failed",
            LinkStatus::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

pub struct Negotiator<C: PeerConnector> {
    remote: ConnectionId,
    local_role: Role,
    generation: u64,
    phase: SignalingPhase,
    link: LinkStatus,
    remote_description_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
    connector: C,
    stream: Option<C::Stream>,
    stream_announced: bool,
    reached_connected: bool,
}

impl<C: PeerConnector> Negotiator<C> {
    pub fn new(remote: ConnectionId, local_role: Role, generation: u64, connector: C) -> Self {
        Self {
            remote,
            local_role,
            generation,
            phase: SignalingPhase::Stable,
            link: LinkStatus::New,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            connector,
            stream: None,
            stream_announced: false,
            reached_connected: false,
        }
    }

    pub fn remote(&self) -> &ConnectionId {
        &self.remote
    }

    pub fn local_role(&self) -> Role {
        self.local_role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn link_status(&self) -> LinkStatus {
        self.link
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_connected(&self) -> bool {
        self.reached_connected
    }

    pub fn stream(&self) -> Option<&C::Stream> {
        self.stream.as_ref()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Produces and applies a local offer. Only legal from `Stable`.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.phase != SignalingPhase::Stable {
            return Err(NegotiationError::ProtocolViolation {
                phase: self.phase,
                action: "create offer",
            });
        }
        let offer = self.connector.create_offer().await?;
        self.connector.set_local_description(offer.clone()).await?;
        self.phase = SignalingPhase::OfferSent;
        self.begin_connecting();
        debug!(remote = %self.remote, "offer created");
        Ok(offer)
    }

    /// Applies a remote offer and returns the local answer to send back.
    pub async fn accept_offer(
        &mut self,
        payload: &Value,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = parse_description(payload, SdpKind::Offer)?;
        if self.phase != SignalingPhase::Stable {
            return Err(NegotiationError::ProtocolViolation {
                phase: self.phase,
                action: "accept offer",
            });
        }

        self.phase = SignalingPhase::OfferReceived;
        let answer = match self.answer_offer(offer).await {
            Ok(answer) => answer,
            Err(err) => {
                self.phase = SignalingPhase::Stable;
                return Err(err);
            }
        };
        self.phase = SignalingPhase::Stable;
        self.begin_connecting();
        debug!(remote = %self.remote, "answer created");
        Ok(answer)
    }

    async fn answer_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.connector.set_remote_description(offer).await?;
        self.remote_description_applied = true;
        self.flush_candidates().await;
        let answer = self.connector.create_answer().await?;
        self.connector.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies the remote answer to our outstanding offer.
    pub async fn accept_answer(&mut self, payload: &Value) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let answer = parse_description(payload, SdpKind::Answer)?;
        if self.phase != SignalingPhase::OfferSent {
            return Err(NegotiationError::ProtocolViolation {
                phase: self.phase,
                action: "accept answer",
            });
        }
        self.connector.set_remote_description(answer).await?;
        self.phase = SignalingPhase::Stable;
        self.remote_description_applied = true;
        self.flush_candidates().await;
        debug!(remote = %self.remote, "answer applied");
        Ok(())
    }

    pub async fn add_remote_candidate(
        &mut self,
        payload: &Value,
    ) -> Result<CandidateDisposition, NegotiationError> {
        self.ensure_open()?;
        let candidate = parse_candidate(payload)?;
        if !self.remote_description_applied {
            self.pending_candidates.push_back(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        self.connector.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = self.connector.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, error = %err, "queued candidate rejected");
            }
        }
    }

    /// Returns true when the status actually changed.
    pub fn update_link(&mut self, next: LinkStatus) -> bool {
        if !self.link.can_transition_to(next) {
            if self.link != next {
                debug!(remote = %self.remote, from = %self.link, to = %next, "link transition ignored");
            }
            return false;
        }
        self.link = next;
        if next == LinkStatus::Connected {
            self.reached_connected = true;
        }
        true
    }

    pub fn attach_stream(&mut self, stream: C::Stream) {
        self.stream = Some(stream);
    }

    /// Hands out the stream once the link is up. Only the first call after
    /// both conditions hold returns it.
    pub fn take_announcement(&mut self) -> Option<C::Stream> {
        if self.stream_announced || self.link != LinkStatus::Connected {
            return None;
        }
        let stream = self.stream.clone()?;
        self.stream_announced = true;
        Some(stream)
    }

    /// Tears down the connector. Idempotent.
    pub async fn close(&mut self) {
        if self.link == LinkStatus::Closed {
            return;
        }
        if let Err(err) = self.connector.close().await {
            warn!(remote = %self.remote, error = %err, "closing peer connection failed");
        }
        self.link = LinkStatus::Closed;
        self.pending_candidates.clear();
        self.stream = None;
        debug!(remote = %self.remote, "negotiation closed");
    }

    fn begin_connecting(&mut self) {
        if self.link == LinkStatus::New {
            self.link = LinkStatus::Connecting;
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.link.is_terminal() {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }
}

fn parse_description(payload: &Value, expected: SdpKind) -> Result<SessionDescription, NegotiationError> {
    let desc = SessionDescription::from_payload(payload)?;
    if desc.kind != expected {
        return Err(NegotiationError::MalformedPayload(format!(
            "expected {expected:?} description, got {:?}",
            desc.kind
        )));
    }
    Ok(desc)
}

/// Accepts either the structured candidate object or a bare candidate line.
fn parse_candidate(payload: &Value) -> Result<IceCandidate, NegotiationError> {
    match payload {
        Value::String(line) if !line.is_empty() => Ok(IceCandidate {
            candidate: line.clone(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        }),
        _ => Ok(IceCandidate::from_payload(payload)?),
    }
}
