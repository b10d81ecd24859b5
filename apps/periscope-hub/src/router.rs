//! Relay Router: the only component that updates the connection and session
//! registries together.

use std::sync::Arc;

use periscope_proto::{ConnectionId, ParticipantInfo, Role, SessionId, SignalKind};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connections::{Association, ConnectionRegistry};
use crate::error::HubError;
use crate::routing::participant_key;
use crate::sessions::{Membership, SessionRegistry};

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub session_id: SessionId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub device_id: Option<String>,
    pub role: Role,
}

pub struct RelayRouter {
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
}

impl RelayRouter {
    pub fn new(connections: Arc<ConnectionRegistry>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            connections,
            sessions,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Joins `connection_id` to a session. The session's actor sends the
    /// joiner `session-joined` before announcing it to the others.
    /// Returns the other current members in join order.
    pub async fn on_join(
        &self,
        connection_id: &ConnectionId,
        request: JoinRequest,
    ) -> Result<Vec<ParticipantInfo>, HubError> {
        let mut kept = self
            .connections
            .lookup(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))?
            .association;

        // A connection belongs to at most one session under one identity.
        if let Some(current) = &kept {
            let same_slot = current.session_id == request.session_id
                && participant_key(&current.user_id, current.device_id.as_deref(), connection_id)
                    == participant_key(
                        &request.user_id,
                        request.device_id.as_deref(),
                        connection_id,
                    );
            if !same_slot {
                self.on_leave(connection_id).await?;
                kept = None;
            }
        }

        // Associated first, so a relay answering the announcement is accepted.
        self.connections.associate(
            connection_id,
            Association {
                session_id: request.session_id.clone(),
                user_id: request.user_id.clone(),
                device_id: request.device_id.clone(),
                role: request.role,
            },
        )?;

        let joined = self
            .sessions
            .join_session(
                &request.session_id,
                Membership {
                    connection_id: connection_id.clone(),
                    user_id: request.user_id,
                    user_name: request.user_name,
                    device_id: request.device_id,
                    role: request.role,
                },
            )
            .await;
        match joined {
            Ok(receipt) => Ok(receipt.others),
            Err(err) => {
                match kept {
                    Some(previous) => {
                        let _ = self.connections.associate(connection_id, previous);
                    }
                    None => {
                        self.connections
                            .disassociate_from(connection_id, &request.session_id);
                    }
                }
                Err(err)
            }
        }
    }

    /// Removes the connection from its session, if any. Returns the session left.
    pub async fn on_leave(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<SessionId>, HubError> {
        let Some(association) = self.connections.association(connection_id) else {
            debug!(connection = %connection_id, "leave without a session");
            return Ok(None);
        };
        let session_id = association.session_id;

        match self
            .sessions
            .leave_session(&session_id, connection_id)
            .await
        {
            Ok(receipt) => {
                debug!(
                    connection = %connection_id,
                    session = %session_id,
                    removed = receipt.removed,
                    ended = receipt.ended,
                    "left session"
                );
            }
            // Swept already; the association is all that is left.
            Err(HubError::SessionNotFound(_)) | Err(HubError::SessionUnavailable(_)) => {}
            Err(err) => return Err(err),
        }
        self.connections.disassociate_from(connection_id, &session_id);
        Ok(Some(session_id))
    }

    /// Forwards a negotiation payload verbatim. Unreachable targets are dropped.
    pub async fn relay(
        &self,
        kind: SignalKind,
        from: &ConnectionId,
        to: ConnectionId,
        claimed_session: &SessionId,
        payload: Value,
    ) {
        let Some(association) = self.connections.association(from) else {
            debug!(from = %from, %kind, "relay from connection outside any session dropped");
            return;
        };
        if &association.session_id != claimed_session {
            debug!(
                from = %from,
                session = %association.session_id,
                claimed = %claimed_session,
                %kind,
                "relay for foreign session dropped"
            );
            return;
        }
        if let Err(err) = self
            .sessions
            .relay(&association.session_id, kind, from.clone(), to, payload)
            .await
        {
            debug!(from = %from, %kind, error = %err, "relay dropped");
        }
    }

    pub async fn broadcast_screen_share(
        &self,
        from: &ConnectionId,
        claimed_session: &SessionId,
        started: bool,
    ) -> Result<(), HubError> {
        let association = self
            .connections
            .association(from)
            .filter(|assoc| &assoc.session_id == claimed_session)
            .ok_or_else(|| HubError::NotInSession(from.clone()))?;
        if !association.role.is_host() {
            warn!(connection = %from, session = %claimed_session, "screen share announced by a client");
        }
        self.sessions
            .screen_share(&association.session_id, from.clone(), started)
            .await
    }

    /// Leave (if joined) then forget the connection.
    pub async fn disconnect(&self, connection_id: &ConnectionId) {
        if let Err(err) = self.on_leave(connection_id).await {
            warn!(connection = %connection_id, error = %err, "leave during disconnect failed");
        }
        if self.connections.deregister(connection_id).is_some() {
            info!(connection = %connection_id, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_proto::ServerMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        router: RelayRouter,
        session_id: SessionId,
    }

    impl Fixture {
        fn new() -> Self {
            let connections = Arc::new(ConnectionRegistry::new());
            let sessions = Arc::new(SessionRegistry::new(connections.clone()));
            let session_id = sessions.create_session("host".into(), "Host".into()).id;
            Self {
                router: RelayRouter::new(connections, sessions),
                session_id,
            }
        }

        fn connect(&self, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.router
                .connections()
                .register(ConnectionId::from(id), tx, None);
            rx
        }

        fn request(&self, user: &str, role: Role) -> JoinRequest {
            JoinRequest {
                session_id: self.session_id.clone(),
                user_id: user.into(),
                user_name: None,
                device_id: None,
                role,
            }
        }

        fn request_on(&self, user: &str, device: &str, role: Role) -> JoinRequest {
            JoinRequest {
                device_id: Some(device.into()),
                ..self.request(user, role)
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn join_announces_and_lists_others() {
        let fx = Fixture::new();
        let mut host = fx.connect("h");
        let mut client = fx.connect("c");

        let others = fx
            .router
            .on_join(&ConnectionId::from("h"), fx.request("host", Role::Host))
            .await
            .unwrap();
        assert!(others.is_empty());

        let others = fx
            .router
            .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
            .await
            .unwrap();
        assert_eq!(
            others,
            vec![ParticipantInfo {
                id: ConnectionId::from("h"),
                user_id: "host".into(),
                device_id: None,
                role: Role::Host,
            }]
        );

        let host_msgs = drain(&mut host);
        assert_eq!(
            host_msgs.last(),
            Some(&ServerMessage::ParticipantJoined {
                connection_id: ConnectionId::from("c"),
                user_id: "viewer".into(),
                role: Role::Client,
            })
        );
        assert_eq!(
            drain(&mut client),
            vec![ServerMessage::SessionJoined {
                session_id: fx.session_id.clone(),
                participants: others,
            }]
        );
    }

    #[tokio::test]
    async fn unknown_connection_cannot_join() {
        let fx = Fixture::new();
        let err = fx
            .router
            .on_join(&ConnectionId::from("ghost"), fx.request("u", Role::Client))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::UnknownConnection(ConnectionId::from("ghost")));
    }

    #[tokio::test]
    async fn relay_requires_live_member_target() {
        let fx = Fixture::new();
        let _host = fx.connect("h");
        let mut client = fx.connect("c");
        let mut outsider = fx.connect("x");
        fx.router
            .on_join(&ConnectionId::from("h"), fx.request("host", Role::Host))
            .await
            .unwrap();
        fx.router
            .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
            .await
            .unwrap();
        drain(&mut client);

        let sdp = json!({"type": "offer", "sdp": "x"});
        fx.router
            .relay(
                SignalKind::Offer,
                &ConnectionId::from("h"),
                ConnectionId::from("x"),
                &fx.session_id,
                sdp.clone(),
            )
            .await;
        fx.router
            .relay(
                SignalKind::Offer,
                &ConnectionId::from("h"),
                ConnectionId::from("c"),
                &fx.session_id,
                sdp.clone(),
            )
            .await;
        // Awaiting a reply from the actor orders us after the relays above.
        fx.router
            .broadcast_screen_share(&ConnectionId::from("h"), &fx.session_id, false)
            .await
            .unwrap();

        assert!(drain(&mut outsider).is_empty());
        let received = drain(&mut client);
        assert_eq!(
            received.first(),
            Some(&ServerMessage::Offer {
                from: ConnectionId::from("h"),
                sdp,
                session_id: fx.session_id.clone(),
            })
        );
    }

    #[tokio::test]
    async fn resume_moves_participant_to_new_connection() {
        let fx = Fixture::new();
        let mut host = fx.connect("h");
        let mut old = fx.connect("c-old");
        let mut new = fx.connect("c-new");
        fx.router
            .on_join(&ConnectionId::from("h"), fx.request("host", Role::Host))
            .await
            .unwrap();
        fx.router
            .on_join(
                &ConnectionId::from("c-old"),
                fx.request_on("viewer", "phone", Role::Client),
            )
            .await
            .unwrap();
        drain(&mut host);
        drain(&mut old);

        fx.router
            .on_join(
                &ConnectionId::from("c-new"),
                fx.request_on("viewer", "phone", Role::Client),
            )
            .await
            .unwrap();

        assert_eq!(
            drain(&mut host),
            vec![
                ServerMessage::ParticipantLeft {
                    connection_id: ConnectionId::from("c-old")
                },
                ServerMessage::ParticipantJoined {
                    connection_id: ConnectionId::from("c-new"),
                    user_id: "viewer".into(),
                    role: Role::Client,
                },
            ]
        );
        assert!(matches!(
            drain(&mut old).as_slice(),
            [ServerMessage::Error { .. }]
        ));
        assert!(fx
            .router
            .connections()
            .association(&ConnectionId::from("c-old"))
            .is_none());
        assert!(matches!(
            drain(&mut new).as_slice(),
            [ServerMessage::SessionJoined { .. }]
        ));

        let session = fx.router.sessions().get(&fx.session_id).unwrap();
        assert_eq!(session.participants.len(), 2);
        assert_eq!(session.participants[1].connection_id, ConnectionId::from("c-new"));

        // Payloads still addressed to the retired id reach the new connection.
        fx.router
            .relay(
                SignalKind::IceCandidate,
                &ConnectionId::from("h"),
                ConnectionId::from("c-old"),
                &fx.session_id,
                json!("candidate:1"),
            )
            .await;
        fx.router
            .broadcast_screen_share(&ConnectionId::from("h"), &fx.session_id, true)
            .await
            .unwrap();
        let received = drain(&mut new);
        assert!(matches!(
            received.first(),
            Some(ServerMessage::IceCandidate { from, .. }) if from.as_str() == "h"
        ));
    }

    #[tokio::test]
    async fn disconnect_leaves_then_deregisters() {
        let fx = Fixture::new();
        let mut host = fx.connect("h");
        let _client = fx.connect("c");
        fx.router
            .on_join(&ConnectionId::from("h"), fx.request("host", Role::Host))
            .await
            .unwrap();
        fx.router
            .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
            .await
            .unwrap();
        drain(&mut host);

        fx.router.disconnect(&ConnectionId::from("c")).await;
        assert!(fx.router.connections().lookup(&ConnectionId::from("c")).is_none());
        assert_eq!(
            drain(&mut host),
            vec![ServerMessage::ParticipantLeft {
                connection_id: ConnectionId::from("c")
            }]
        );
        assert_eq!(
            fx.router.sessions().get(&fx.session_id).unwrap().participants.len(),
            1
        );
    }

    #[tokio::test]
    async fn joining_another_session_leaves_the_first() {
        let fx = Fixture::new();
        let _c = fx.connect("c");
        let other = fx
            .router
            .sessions()
            .create_session("other".into(), "Other".into())
            .id;
        fx.router
            .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
            .await
            .unwrap();
        let mut second = fx.request("viewer", Role::Client);
        second.session_id = other.clone();
        fx.router
            .on_join(&ConnectionId::from("c"), second)
            .await
            .unwrap();

        assert_eq!(
            fx.router
                .connections()
                .association(&ConnectionId::from("c"))
                .map(|a| a.session_id),
            Some(other)
        );
        let first = fx.router.sessions().get(&fx.session_id).unwrap();
        assert!(first.participants.is_empty());
    }

    #[tokio::test]
    async fn second_tab_without_device_does_not_evict_the_first() {
        let fx = Fixture::new();
        let mut first = fx.connect("tab-1");
        let _second = fx.connect("tab-2");
        fx.router
            .on_join(&ConnectionId::from("tab-1"), fx.request("viewer", Role::Client))
            .await
            .unwrap();
        drain(&mut first);

        fx.router
            .on_join(&ConnectionId::from("tab-2"), fx.request("viewer", Role::Client))
            .await
            .unwrap();

        assert!(fx
            .router
            .connections()
            .association(&ConnectionId::from("tab-1"))
            .is_some());
        assert!(!drain(&mut first)
            .iter()
            .any(|message| matches!(message, ServerMessage::Error { .. })));
        assert_eq!(
            fx.router.sessions().get(&fx.session_id).unwrap().participants.len(),
            2
        );
    }

    #[tokio::test]
    async fn rejoin_with_new_role_keeps_registries_in_step() {
        let fx = Fixture::new();
        let _c = fx.connect("c");
        let c = ConnectionId::from("c");
        fx.router
            .on_join(&c, fx.request("viewer", Role::Client))
            .await
            .unwrap();
        fx.router
            .on_join(&c, fx.request("viewer", Role::Host))
            .await
            .unwrap();

        assert_eq!(
            fx.router.connections().association(&c).map(|a| a.role),
            Some(Role::Host)
        );
        let session = fx.router.sessions().get(&fx.session_id).unwrap();
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.participants[0].connection_id, c);
    }

    #[tokio::test]
    async fn failed_join_drops_the_fresh_association() {
        let fx = Fixture::new();
        let _c = fx.connect("c");
        fx.router.sessions().end_session(&fx.session_id).await.unwrap();
        let err = fx
            .router
            .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::SessionEnded(fx.session_id.clone()));
        assert!(fx
            .router
            .connections()
            .association(&ConnectionId::from("c"))
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn offer_sent_on_announcement_arrives_after_session_joined() {
        for round in 0..200 {
            let fx = Arc::new(Fixture::new());
            let mut host = fx.connect("h");
            let mut client = fx.connect("c");
            fx.router
                .on_join(&ConnectionId::from("h"), fx.request("host", Role::Host))
                .await
                .unwrap();
            drain(&mut host);

            // The host offers the moment it hears about the client.
            let host_side = {
                let fx = fx.clone();
                tokio::spawn(async move {
                    while let Some(message) = host.recv().await {
                        if let ServerMessage::ParticipantJoined { connection_id, .. } = message {
                            fx.router
                                .relay(
                                    SignalKind::Offer,
                                    &ConnectionId::from("h"),
                                    connection_id,
                                    &fx.session_id,
                                    json!({"type": "offer", "sdp": "x"}),
                                )
                                .await;
                            return;
                        }
                    }
                })
            };
            fx.router
                .on_join(&ConnectionId::from("c"), fx.request("viewer", Role::Client))
                .await
                .unwrap();
            host_side.await.unwrap();

            let first = client.recv().await;
            let second = client.recv().await;
            assert!(
                matches!(first, Some(ServerMessage::SessionJoined { .. })),
                "round {round}: first frame {first:?}"
            );
            assert!(
                matches!(second, Some(ServerMessage::Offer { .. })),
                "round {round}: second frame {second:?}"
            );
        }
    }
}
