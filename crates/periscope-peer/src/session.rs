//! Per-session driver on the participant side.
//!
//! [`PeerSession`] consumes hub messages, applies role pairing, owns one
//! [`Negotiator`] per remote connection and reports what happens to the
//! application as [`PeerEvent`]s.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use periscope_proto::{ClientMessage, ConnectionId, Role, ServerMessage, SessionId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connector::{ConnectorContext, ConnectorEvent, ConnectorFactory, EventSink, StreamOf, TaggedEvent};
use crate::error::{NegotiationError, SignalingError};
use crate::negotiation::{LinkStatus, Negotiator};
use crate::pairing::{accepts_offer_from, initiative, Initiative};
use crate::signaling::SignalingClient;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub session_id: SessionId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub device_id: Option<String>,
    pub role: Role,
    /// How long an instance may take to reach `connected` before it is failed.
    pub connect_timeout: Duration,
}

impl PeerSessionConfig {
    pub fn new(session_id: SessionId, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            user_name: None,
            device_id: None,
            role,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinSession {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            device_id: self.device_id.clone(),
            role: self.role,
        }
    }
}

pub enum PeerEvent<S> {
    LinkStatusChanged {
        remote: ConnectionId,
        status: LinkStatus,
    },
    StreamAvailable {
        remote: ConnectionId,
        stream: S,
    },
    PeerClosed {
        remote: ConnectionId,
    },
    ScreenShare {
        host: ConnectionId,
        active: bool,
    },
    SessionEnded,
}

impl<S> fmt::Debug for PeerEvent<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LinkStatusChanged { remote, status } => f
                .debug_struct("LinkStatusChanged")
                .field("remote", remote)
                .field("status", status)
                .finish(),
            PeerEvent::StreamAvailable { remote, .. } => f
                .debug_struct("StreamAvailable")
                .field("remote", remote)
                .finish_non_exhaustive(),
            PeerEvent::PeerClosed { remote } => {
                f.debug_struct("PeerClosed").field("remote", remote).finish()
            }
            PeerEvent::ScreenShare { host, active } => f
                .debug_struct("ScreenShare")
                .field("host", host)
                .field("active", active)
                .finish(),
            PeerEvent::SessionEnded => f.write_str("SessionEnded"),
        }
    }
}

enum Control {
    Leave(oneshot::Sender<()>),
}

/// Requests into a running [`PeerSession`].
#[derive(Clone)]
pub struct PeerSessionHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl PeerSessionHandle {
    /// Closes every negotiation instance, then tells the hub the participant
    /// left. Resolves once both have happened; the driver stops afterwards.
    pub async fn leave(&self) -> Result<(), SignalingError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.control
            .send(Control::Leave(done_tx))
            .map_err(|_| SignalingError::ChannelClosed)?;
        done_rx.await.map_err(|_| SignalingError::ChannelClosed)
    }
}

pub struct PeerSession<F: ConnectorFactory> {
    config: PeerSessionConfig,
    factory: F,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedSender<PeerEvent<StreamOf<F>>>,
    peers: HashMap<ConnectionId, Negotiator<F::Connector>>,
    roles: HashMap<ConnectionId, Role>,
    /// Offers that arrived before the sender was announced.
    pending_offers: HashMap<ConnectionId, Value>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    connector_tx: mpsc::UnboundedSender<TaggedEvent<StreamOf<F>>>,
    connector_rx: mpsc::UnboundedReceiver<TaggedEvent<StreamOf<F>>>,
    timeout_tx: mpsc::UnboundedSender<(ConnectionId, u64)>,
    timeout_rx: mpsc::UnboundedReceiver<(ConnectionId, u64)>,
    next_generation: u64,
}

impl<F: ConnectorFactory> PeerSession<F> {
    pub fn new(
        config: PeerSessionConfig,
        factory: F,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent<StreamOf<F>>>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (connector_tx, connector_rx) = mpsc::unbounded_channel();
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            factory,
            outbound,
            events,
            peers: HashMap::new(),
            roles: HashMap::new(),
            pending_offers: HashMap::new(),
            control_tx,
            control_rx,
            connector_tx,
            connector_rx,
            timeout_tx,
            timeout_rx,
            next_generation: 0,
        };
        (session, events_rx)
    }

    pub fn handle(&self) -> PeerSessionHandle {
        PeerSessionHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Sends the join request, then processes hub messages until the inbound
    /// channel closes, the session ends or the participant leaves. All
    /// instances are closed on exit.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
        self.send(self.config.join_message());
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        if !self.handle_server_message(message).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(tagged) = self.connector_rx.recv() => self.handle_connector_event(tagged).await,
                Some((remote, generation)) = self.timeout_rx.recv() => {
                    self.handle_connect_timeout(remote, generation).await
                }
                Some(control) = self.control_rx.recv() => match control {
                    Control::Leave(done) => {
                        info!(session = %self.config.session_id, "leaving session");
                        self.close_all().await;
                        self.send(ClientMessage::LeaveSession);
                        let _ = done.send(());
                        break;
                    }
                },
            }
        }
        self.close_all().await;
        debug!(session = %self.config.session_id, "peer session stopped");
    }

    async fn handle_server_message(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::SessionJoined {
                session_id,
                participants,
            } => {
                if session_id != self.config.session_id {
                    warn!(session = %session_id, "joined an unexpected session");
                    return true;
                }
                info!(session = %session_id, members = participants.len(), "joined session");
                for participant in participants {
                    self.roles.insert(participant.id.clone(), participant.role);
                    self.pair_with(participant.id.clone(), participant.role).await;
                    self.replay_held_offer(participant.id).await;
                }
            }
            ServerMessage::ParticipantJoined {
                connection_id,
                role,
                ..
            } => {
                self.roles.insert(connection_id.clone(), role);
                self.pair_with(connection_id.clone(), role).await;
                self.replay_held_offer(connection_id).await;
            }
            ServerMessage::ParticipantLeft { connection_id } => {
                self.roles.remove(&connection_id);
                self.pending_offers.remove(&connection_id);
                self.close_peer(&connection_id).await;
            }
            ServerMessage::Offer {
                from,
                sdp,
                session_id,
            } => self.on_offer(from, sdp, session_id).await,
            ServerMessage::Answer {
                from,
                sdp,
                session_id,
            } => self.on_answer(from, sdp, session_id).await,
            ServerMessage::IceCandidate {
                from,
                candidate,
                session_id,
            } => self.on_candidate(from, candidate, session_id).await,
            ServerMessage::ScreenShareStarted { host_id, .. } => self.emit(PeerEvent::ScreenShare {
                host: host_id,
                active: true,
            }),
            ServerMessage::ScreenShareStopped { host_id, .. } => self.emit(PeerEvent::ScreenShare {
                host: host_id,
                active: false,
            }),
            ServerMessage::SessionEnded { session_id } => {
                if session_id == self.config.session_id {
                    info!(session = %session_id, "session ended by hub");
                    self.close_all().await;
                    self.emit(PeerEvent::SessionEnded);
                    return false;
                }
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => {
                warn!(session = %self.config.session_id, %message, "hub reported an error");
            }
        }
        true
    }

    async fn pair_with(&mut self, remote: ConnectionId, remote_role: Role) {
        if self.peers.contains_key(&remote) {
            return;
        }
        match initiative(self.config.role, remote_role) {
            Initiative::Offer => {
                if let Err(err) = self.open(remote.clone(), remote_role).await {
                    warn!(remote = %remote, error = %err, "could not open peer connection");
                    return;
                }
                self.send_offer(&remote).await;
            }
            Initiative::AwaitOffer => {
                if let Err(err) = self.open(remote.clone(), remote_role).await {
                    warn!(remote = %remote, error = %err, "could not open peer connection");
                }
            }
            Initiative::None => {
                debug!(remote = %remote, role = %remote_role, "same role; not negotiating");
            }
        }
    }

    async fn open(&mut self, remote: ConnectionId, remote_role: Role) -> Result<(), NegotiationError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = EventSink::new(remote.clone(), generation, self.connector_tx.clone());
        let context = ConnectorContext {
            remote: remote.clone(),
            local_role: self.config.role,
            remote_role,
        };
        let connector = self.factory.create(context, sink).await?;
        self.peers.insert(
            remote.clone(),
            Negotiator::new(remote.clone(), self.config.role, generation, connector),
        );

        let timeout_tx = self.timeout_tx.clone();
        let timeout = self.config.connect_timeout;
        let timer_remote = remote.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeout_tx.send((timer_remote, generation));
        });
        debug!(remote = %remote, generation, "negotiation instance opened");
        Ok(())
    }

    async fn send_offer(&mut self, remote: &ConnectionId) {
        let Some(negotiator) = self.peers.get_mut(remote) else {
            return;
        };
        let before = negotiator.link_status();
        let result = negotiator.create_offer().await;
        let after = negotiator.link_status();
        match result {
            Ok(offer) => self.send(ClientMessage::Offer {
                to: remote.clone(),
                sdp: offer.to_payload(),
                session_id: self.config.session_id.clone(),
            }),
            Err(err) => warn!(remote = %remote, error = %err, "offer dropped"),
        }
        self.report_transition(remote, before, after);
    }

    async fn on_offer(&mut self, from: ConnectionId, sdp: Value, session_id: SessionId) {
        if session_id != self.config.session_id {
            warn!(from = %from, session = %session_id, "offer for another session dropped");
            return;
        }
        if !self.peers.contains_key(&from) {
            let Some(role) = self.roles.get(&from).copied() else {
                debug!(from = %from, "offer from a participant not yet announced held");
                self.pending_offers.insert(from, sdp);
                return;
            };
            if !accepts_offer_from(self.config.role, role) {
                warn!(from = %from, role = %role, "unsolicited offer violates role pairing");
                return;
            }
            if let Err(err) = self.open(from.clone(), role).await {
                warn!(remote = %from, error = %err, "could not open peer connection");
                return;
            }
        }

        let Some(negotiator) = self.peers.get_mut(&from) else {
            return;
        };
        let before = negotiator.link_status();
        let result = negotiator.accept_offer(&sdp).await;
        let after = negotiator.link_status();
        match result {
            Ok(answer) => self.send(ClientMessage::Answer {
                to: from.clone(),
                sdp: answer.to_payload(),
                session_id,
            }),
            Err(err) => warn!(from = %from, error = %err, "offer dropped"),
        }
        self.report_transition(&from, before, after);
    }

    async fn replay_held_offer(&mut self, remote: ConnectionId) {
        if let Some(sdp) = self.pending_offers.remove(&remote) {
            debug!(remote = %remote, "replaying held offer");
            let session_id = self.config.session_id.clone();
            self.on_offer(remote, sdp, session_id).await;
        }
    }

    async fn on_answer(&mut self, from: ConnectionId, sdp: Value, session_id: SessionId) {
        if session_id != self.config.session_id {
            warn!(from = %from, session = %session_id, "answer for another session dropped");
            return;
        }
        let Some(negotiator) = self.peers.get_mut(&from) else {
            warn!(from = %from, "answer without a negotiation dropped");
            return;
        };
        if let Err(err) = negotiator.accept_answer(&sdp).await {
            warn!(from = %from, error = %err, "answer dropped");
        }
    }

    async fn on_candidate(&mut self, from: ConnectionId, candidate: Value, session_id: SessionId) {
        if session_id != self.config.session_id {
            debug!(from = %from, session = %session_id, "candidate for another session dropped");
            return;
        }
        let Some(negotiator) = self.peers.get_mut(&from) else {
            debug!(from = %from, "candidate without a negotiation dropped");
            return;
        };
        match negotiator.add_remote_candidate(&candidate).await {
            Ok(disposition) => debug!(from = %from, ?disposition, "remote candidate"),
            Err(err) => warn!(from = %from, error = %err, "candidate dropped"),
        }
    }

    async fn handle_connector_event(&mut self, tagged: TaggedEvent<StreamOf<F>>) {
        let remote = tagged.remote;
        let current = self
            .peers
            .get(&remote)
            .is_some_and(|n| n.generation() == tagged.generation);
        if !current {
            debug!(remote = %remote, generation = tagged.generation, "event from a retired connector ignored");
            return;
        }

        match tagged.event {
            ConnectorEvent::LocalCandidate(candidate) => self.send(ClientMessage::IceCandidate {
                to: remote,
                candidate: candidate.to_payload(),
                session_id: self.config.session_id.clone(),
            }),
            ConnectorEvent::LinkStatus(status) => {
                let (changed, announcement) = match self.peers.get_mut(&remote) {
                    Some(negotiator) => {
                        let changed = negotiator.update_link(status);
                        (changed, negotiator.take_announcement())
                    }
                    None => return,
                };
                if !changed {
                    return;
                }
                debug!(remote = %remote, %status, "link status");
                self.emit(PeerEvent::LinkStatusChanged {
                    remote: remote.clone(),
                    status,
                });
                if let Some(stream) = announcement {
                    self.emit(PeerEvent::StreamAvailable {
                        remote: remote.clone(),
                        stream,
                    });
                }
                match status {
                    LinkStatus::Failed => {
                        warn!(remote = %remote, "peer link failed");
                        self.close_peer(&remote).await;
                    }
                    LinkStatus::Closed => {
                        self.peers.remove(&remote);
                        self.emit(PeerEvent::PeerClosed { remote });
                    }
                    _ => {}
                }
            }
            ConnectorEvent::RemoteStream(stream) => {
                let announcement = match self.peers.get_mut(&remote) {
                    Some(negotiator) => {
                        negotiator.attach_stream(stream);
                        negotiator.take_announcement()
                    }
                    None => None,
                };
                if let Some(stream) = announcement {
                    self.emit(PeerEvent::StreamAvailable { remote, stream });
                }
            }
        }
    }

    async fn handle_connect_timeout(&mut self, remote: ConnectionId, generation: u64) {
        let failed = match self.peers.get_mut(&remote) {
            Some(negotiator) if negotiator.generation() == generation && !negotiator.has_connected() => {
                negotiator.update_link(LinkStatus::Failed)
            }
            _ => return,
        };
        warn!(remote = %remote, "peer did not connect in time");
        if failed {
            self.emit(PeerEvent::LinkStatusChanged {
                remote: remote.clone(),
                status: LinkStatus::Failed,
            });
        }
        self.close_peer(&remote).await;
    }

    async fn close_peer(&mut self, remote: &ConnectionId) {
        let Some(mut negotiator) = self.peers.remove(remote) else {
            return;
        };
        let was_closed = negotiator.link_status() == LinkStatus::Closed;
        negotiator.close().await;
        if !was_closed {
            self.emit(PeerEvent::LinkStatusChanged {
                remote: remote.clone(),
                status: LinkStatus::Closed,
            });
        }
        self.emit(PeerEvent::PeerClosed {
            remote: remote.clone(),
        });
        info!(remote = %remote, "peer closed");
    }

    async fn close_all(&mut self) {
        let remotes: Vec<ConnectionId> = self.peers.keys().cloned().collect();
        for remote in remotes {
            self.close_peer(&remote).await;
        }
    }

    fn report_transition(&self, remote: &ConnectionId, before: LinkStatus, after: LinkStatus) {
        if before != after {
            self.emit(PeerEvent::LinkStatusChanged {
                remote: remote.clone(),
                status: after,
            });
        }
    }

    fn emit(&self, event: PeerEvent<StreamOf<F>>) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: ClientMessage) {
        if self.outbound.send(message).is_err() {
            debug!(session = %self.config.session_id, "signaling channel closed; message dropped");
        }
    }
}

/// A running peer session attached to the hub.
pub struct ConnectedSession<S> {
    pub client: SignalingClient,
    pub events: mpsc::UnboundedReceiver<PeerEvent<S>>,
    pub handle: PeerSessionHandle,
    pub task: JoinHandle<()>,
}

impl<S> ConnectedSession<S> {
    pub async fn leave(&self) -> Result<(), SignalingError> {
        self.handle.leave().await
    }
}

/// Connects to the hub at `url`, joins the configured session and drives it
/// in a background task.
pub async fn connect<F: ConnectorFactory>(
    url: &str,
    config: PeerSessionConfig,
    factory: F,
) -> Result<ConnectedSession<StreamOf<F>>, SignalingError> {
    let (client, inbound) = SignalingClient::connect(url).await?;
    let (session, events) = PeerSession::new(config, factory, client.sender());
    let handle = session.handle();
    let task = tokio::spawn(session.run(inbound));
    Ok(ConnectedSession {
        client,
        events,
        handle,
        task,
    })
}
