use std::sync::Arc;

use chrono::Utc;
use periscope_proto::{ConnectionId, ParticipantInfo, ServerMessage, SignalKind};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{JoinReceipt, LeaveReceipt, Membership, Participant, Session, SessionStatus};
use crate::connections::ConnectionRegistry;
use crate::error::HubError;
use crate::routing::{participant_key, BindOutcome, Member, RoutingGroup};

const COMMAND_CAPACITY: usize = 64;

pub(super) enum Command {
    Join {
        membership: Membership,
        reply: oneshot::Sender<Result<JoinReceipt, HubError>>,
    },
    Leave {
        connection_id: ConnectionId,
        reply: oneshot::Sender<LeaveReceipt>,
    },
    Relay {
        kind: SignalKind,
        from: ConnectionId,
        to: ConnectionId,
        payload: Value,
    },
    ScreenShare {
        from: ConnectionId,
        started: bool,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    End {
        reply: oneshot::Sender<Session>,
    },
}

#[derive(Clone)]
pub(super) struct SessionHandle {
    pub commands: mpsc::Sender<Command>,
    pub snapshot: watch::Receiver<Session>,
}

/// Sole owner of one session's record and routing group.
pub(super) struct SessionActor {
    session: Session,
    group: RoutingGroup,
    connections: Arc<ConnectionRegistry>,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<Session>,
}

impl SessionActor {
    pub fn spawn(session: Session, connections: Arc<ConnectionRegistry>) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.clone());
        let actor = SessionActor {
            session,
            group: RoutingGroup::new(),
            connections,
            commands: command_rx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run());
        SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        debug!(session = %self.session.id, "session actor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join { membership, reply } => {
                let result = self.join(membership);
                self.publish();
                let _ = reply.send(result);
            }
            Command::Leave {
                connection_id,
                reply,
            } => {
                let receipt = self.leave(&connection_id);
                self.publish();
                let _ = reply.send(receipt);
            }
            Command::Relay {
                kind,
                from,
                to,
                payload,
            } => self.relay(kind, from, to, payload),
            Command::ScreenShare {
                from,
                started,
                reply,
            } => {
                let result = self.screen_share(from, started);
                self.publish();
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.end();
                self.publish();
                let _ = reply.send(self.session.clone());
            }
        }
    }

    fn publish(&mut self) {
        self.session.participants = self
            .group
            .members()
            .iter()
            .map(|member| Participant {
                participant_id: member.participant_id.clone(),
                participant_name: member.participant_name.clone(),
                connection_id: member.connection_id.clone(),
                joined_at: member.joined_at,
            })
            .collect();
        self.snapshot.send_replace(self.session.clone());
    }

    fn join(&mut self, membership: Membership) -> Result<JoinReceipt, HubError> {
        if self.session.status == SessionStatus::Ended {
            return Err(HubError::SessionEnded(self.session.id.clone()));
        }

        let connection_id = membership.connection_id.clone();
        let role = membership.role;
        let member = Member {
            participant_id: participant_key(
                &membership.user_id,
                membership.device_id.as_deref(),
                &connection_id,
            ),
            participant_name: membership
                .user_name
                .clone()
                .unwrap_or_else(|| membership.user_id.clone()),
            connection_id: connection_id.clone(),
            user_id: membership.user_id.clone(),
            device_id: membership.device_id,
            role,
            joined_at: Utc::now(),
        };

        let outcome = self.group.bind(member);
        let others: Vec<ParticipantInfo> = self
            .group
            .members()
            .iter()
            .filter(|member| member.connection_id != connection_id)
            .map(Member::info)
            .collect();

        // The joiner learns the roster before anyone can address it.
        self.connections.send(
            &connection_id,
            ServerMessage::SessionJoined {
                session_id: self.session.id.clone(),
                participants: others.clone(),
            },
        );

        let joined = ServerMessage::ParticipantJoined {
            connection_id: connection_id.clone(),
            user_id: membership.user_id,
            role,
        };
        match &outcome {
            BindOutcome::Joined => {
                info!(session = %self.session.id, connection = %connection_id, %role, "participant joined");
                self.fan_out(&connection_id, joined);
            }
            BindOutcome::Rejoined { previous_role } if *previous_role != role => {
                info!(
                    session = %self.session.id,
                    connection = %connection_id,
                    from = %previous_role,
                    to = %role,
                    "participant changed role"
                );
                self.fan_out(
                    &connection_id,
                    ServerMessage::ParticipantLeft {
                        connection_id: connection_id.clone(),
                    },
                );
                self.fan_out(&connection_id, joined);
            }
            BindOutcome::Rejoined { .. } => {
                debug!(session = %self.session.id, connection = %connection_id, "repeated join ignored");
            }
            BindOutcome::Resumed { previous } => {
                info!(
                    session = %self.session.id,
                    connection = %connection_id,
                    previous = %previous,
                    "participant resumed on a new connection"
                );
                self.connections.send(
                    previous,
                    ServerMessage::error("session resumed from another connection"),
                );
                self.connections.disassociate_from(previous, &self.session.id);
                self.fan_out(
                    &connection_id,
                    ServerMessage::ParticipantLeft {
                        connection_id: previous.clone(),
                    },
                );
                self.fan_out(&connection_id, joined);
            }
        }

        if !role.is_host() && self.session.status == SessionStatus::Waiting {
            self.session.status = SessionStatus::Active;
            info!(session = %self.session.id, "session active");
        }

        Ok(JoinReceipt { outcome, others })
    }

    fn leave(&mut self, connection_id: &ConnectionId) -> LeaveReceipt {
        let Some(member) = self.group.unbind(connection_id) else {
            return LeaveReceipt {
                removed: false,
                ended: self.session.status == SessionStatus::Ended,
            };
        };
        info!(
            session = %self.session.id,
            connection = %connection_id,
            participant = %member.participant_id,
            "participant left"
        );
        self.fan_out(
            connection_id,
            ServerMessage::ParticipantLeft {
                connection_id: connection_id.clone(),
            },
        );
        if self.group.is_empty() {
            self.mark_ended();
        }
        LeaveReceipt {
            removed: true,
            ended: self.session.status == SessionStatus::Ended,
        }
    }

    fn relay(&self, kind: SignalKind, from: ConnectionId, to: ConnectionId, payload: Value) {
        if self.session.status == SessionStatus::Ended {
            debug!(session = %self.session.id, from = %from, %kind, "relay into ended session dropped");
            return;
        }
        if !self.group.is_current(&from) {
            debug!(session = %self.session.id, from = %from, %kind, "relay from non-member dropped");
            return;
        }
        let Some(target) = self.group.resolve(&to).cloned() else {
            debug!(session = %self.session.id, from = %from, to = %to, %kind, "relay target unreachable");
            return;
        };
        debug!(session = %self.session.id, from = %from, to = %target, %kind, "relaying");
        let message = kind.deliver(from, payload, self.session.id.clone());
        if !self.connections.send(&target, message) {
            debug!(session = %self.session.id, to = %target, %kind, "relay target writer closed");
        }
    }

    fn screen_share(&mut self, from: ConnectionId, started: bool) -> Result<(), HubError> {
        if self.session.status == SessionStatus::Ended {
            return Err(HubError::SessionEnded(self.session.id.clone()));
        }
        if !self.group.is_current(&from) {
            return Err(HubError::NotInSession(from));
        }
        self.session.is_screen_sharing = started;
        let session_id = self.session.id.clone();
        let message = if started {
            ServerMessage::ScreenShareStarted {
                host_id: from.clone(),
                session_id,
            }
        } else {
            ServerMessage::ScreenShareStopped {
                host_id: from.clone(),
                session_id,
            }
        };
        self.fan_out(&from, message);
        Ok(())
    }

    fn end(&mut self) {
        if self.session.status == SessionStatus::Ended {
            return;
        }
        self.mark_ended();
        for member in self.group.members() {
            self.connections.send(
                &member.connection_id,
                ServerMessage::SessionEnded {
                    session_id: self.session.id.clone(),
                },
            );
        }
    }

    fn mark_ended(&mut self) {
        if self.session.ended_at.is_none() {
            self.session.ended_at = Some(Utc::now());
        }
        self.session.status = SessionStatus::Ended;
        self.session.is_screen_sharing = false;
        info!(session = %self.session.id, "session ended");
    }

    fn fan_out(&self, except: &ConnectionId, message: ServerMessage) {
        for target in self.group.connections_except(except) {
            self.connections.send(target, message.clone());
        }
    }
}
