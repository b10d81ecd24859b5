//! Logical sessions and their lifecycle.
//!
//! Each session is owned by one actor task; the registry maps ids to actor
//! handles. Mutations go through the actor's command queue, reads come from
//! the snapshot the actor publishes after every command.

mod actor;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use periscope_proto::{ConnectionId, ParticipantInfo, Role, SessionId, SignalKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connections::ConnectionRegistry;
use crate::error::HubError;
use crate::routing::BindOutcome;
use actor::{Command, SessionActor, SessionHandle};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: String,
    pub participant_name: String,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub host_id: String,
    pub host_name: String,
    pub status: SessionStatus,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub is_screen_sharing: bool,
}

/// A connection asking to take part in a session.
#[derive(Debug, Clone)]
pub struct Membership {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: Option<String>,
    pub device_id: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct JoinReceipt {
    pub outcome: BindOutcome,
    /// Other current members in join order.
    pub others: Vec<ParticipantInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveReceipt {
    pub removed: bool,
    pub ended: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLoad {
    pub session_id: SessionId,
    pub participant_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub total_connections: usize,
    pub active_sessions: usize,
    pub sessions: Vec<SessionLoad>,
}

pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    connections: Arc<ConnectionRegistry>,
}

impl SessionRegistry {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            connections,
        }
    }

    pub fn create_session(&self, host_id: String, host_name: String) -> Session {
        let session = Session {
            id: SessionId::generate(),
            host_id,
            host_name,
            status: SessionStatus::Waiting,
            participants: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
            is_screen_sharing: false,
        };
        let handle = SessionActor::spawn(session.clone(), self.connections.clone());
        self.sessions.insert(session.id.clone(), handle);
        info!(session = %session.id, host = %session.host_id, "session created");
        session
    }

    pub async fn join_session(
        &self,
        session_id: &SessionId,
        membership: Membership,
    ) -> Result<JoinReceipt, HubError> {
        self.request(session_id, |reply| Command::Join { membership, reply })
            .await?
    }

    /// Leaving a session the connection is not part of is a no-op.
    pub async fn leave_session(
        &self,
        session_id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Result<LeaveReceipt, HubError> {
        let connection_id = connection_id.clone();
        self.request(session_id, |reply| Command::Leave {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn relay(
        &self,
        session_id: &SessionId,
        kind: SignalKind,
        from: ConnectionId,
        to: ConnectionId,
        payload: Value,
    ) -> Result<(), HubError> {
        let handle = self.handle(session_id)?;
        handle
            .commands
            .send(Command::Relay {
                kind,
                from,
                to,
                payload,
            })
            .await
            .map_err(|_| HubError::SessionUnavailable(session_id.clone()))
    }

    pub async fn screen_share(
        &self,
        session_id: &SessionId,
        from: ConnectionId,
        started: bool,
    ) -> Result<(), HubError> {
        self.request(session_id, |reply| Command::ScreenShare {
            from,
            started,
            reply,
        })
        .await?
    }

    pub async fn end_session(&self, session_id: &SessionId) -> Result<Session, HubError> {
        self.request(session_id, |reply| Command::End { reply }).await
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions
            .get(session_id)
            .map(|handle| handle.snapshot.borrow().clone())
    }

    /// Waiting and active sessions, newest first.
    pub fn list_active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.snapshot.borrow().clone())
            .filter(|session| session.status != SessionStatus::Ended)
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn stats(&self) -> HubStats {
        let active = self.list_active();
        HubStats {
            total_connections: self.connections.len(),
            active_sessions: active.len(),
            sessions: active
                .into_iter()
                .map(|session| SessionLoad {
                    participant_count: session.participants.len(),
                    session_id: session.id,
                })
                .collect(),
        }
    }

    /// Drops sessions that ended more than `retention` ago. Their actors stop
    /// once the last handle is gone.
    pub fn sweep_ended(&self, retention: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let snapshot = entry.snapshot.borrow();
                let ended_at = snapshot.ended_at?;
                let elapsed = (now - ended_at).to_std().unwrap_or_default();
                (snapshot.status == SessionStatus::Ended && elapsed > retention)
                    .then(|| entry.key().clone())
            })
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            debug!(session = %id, "ended session swept");
        }
        expired
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, retention: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let swept = self.sweep_ended(retention);
                if !swept.is_empty() {
                    info!(count = swept.len(), "swept ended sessions");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn handle(&self, session_id: &SessionId) -> Result<SessionHandle, HubError> {
        self.sessions
            .get(session_id)
            .map(|handle| handle.clone())
            .ok_or_else(|| HubError::SessionNotFound(session_id.clone()))
    }

    async fn request<T>(
        &self,
        session_id: &SessionId,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let handle = self.handle(session_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(command(reply_tx))
            .await
            .map_err(|_| HubError::SessionUnavailable(session_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| HubError::SessionUnavailable(session_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_proto::ServerMessage;
    use tokio::sync::mpsc;

    fn connect(
        connections: &ConnectionRegistry,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        connections.register(ConnectionId::from(id), tx, None);
        rx
    }

    fn membership(connection: &str, user: &str, role: Role) -> Membership {
        Membership {
            connection_id: ConnectionId::from(connection),
            user_id: user.into(),
            user_name: None,
            device_id: None,
            role,
        }
    }

    fn registry() -> (Arc<ConnectionRegistry>, SessionRegistry) {
        let connections = Arc::new(ConnectionRegistry::new());
        let sessions = SessionRegistry::new(connections.clone());
        (connections, sessions)
    }

    #[tokio::test]
    async fn first_client_activates_and_last_leave_ends() {
        let (connections, sessions) = registry();
        let _host = connect(&connections, "h");
        let _client = connect(&connections, "c");
        let session = sessions.create_session("host-user".into(), "Host".into());
        assert_eq!(session.status, SessionStatus::Waiting);

        sessions
            .join_session(&session.id, membership("h", "host-user", Role::Host))
            .await
            .expect("host joins");
        assert_eq!(
            sessions.get(&session.id).map(|s| s.status),
            Some(SessionStatus::Waiting)
        );

        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .expect("client joins");
        assert_eq!(
            sessions.get(&session.id).map(|s| s.status),
            Some(SessionStatus::Active)
        );

        sessions
            .leave_session(&session.id, &ConnectionId::from("h"))
            .await
            .unwrap();
        let receipt = sessions
            .leave_session(&session.id, &ConnectionId::from("c"))
            .await
            .unwrap();
        assert!(receipt.removed && receipt.ended);

        let ended = sessions.get(&session.id).expect("still readable");
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert!(ended.participants.is_empty());
        assert!(sessions.list_active().is_empty());
    }

    #[tokio::test]
    async fn join_errors() {
        let (connections, sessions) = registry();
        let _c = connect(&connections, "c");
        let missing = SessionId::from("missing");
        assert!(matches!(
            sessions
                .join_session(&missing, membership("c", "u", Role::Client))
                .await,
            Err(HubError::SessionNotFound(_))
        ));

        let session = sessions.create_session("h".into(), "H".into());
        sessions.end_session(&session.id).await.unwrap();
        assert!(matches!(
            sessions
                .join_session(&session.id, membership("c", "u", Role::Client))
                .await,
            Err(HubError::SessionEnded(_))
        ));
    }

    #[tokio::test]
    async fn repeated_join_is_idempotent() {
        let (connections, sessions) = registry();
        let mut host_rx = connect(&connections, "h");
        let _c = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("h", "h", Role::Host))
            .await
            .unwrap();

        let first = sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();
        let second = sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();
        assert_eq!(first.outcome, BindOutcome::Joined);
        assert_eq!(
            second.outcome,
            BindOutcome::Rejoined {
                previous_role: Role::Client
            }
        );
        assert_eq!(sessions.get(&session.id).unwrap().participants.len(), 2);

        let mut joined = 0;
        while let Ok(message) = host_rx.try_recv() {
            if matches!(message, ServerMessage::ParticipantJoined { .. }) {
                joined += 1;
            }
        }
        assert_eq!(joined, 1);
    }

    #[tokio::test]
    async fn leave_of_non_member_is_silent() {
        let (_connections, sessions) = registry();
        let session = sessions.create_session("h".into(), "H".into());
        let receipt = sessions
            .leave_session(&session.id, &ConnectionId::from("stranger"))
            .await
            .unwrap();
        assert_eq!(
            receipt,
            LeaveReceipt {
                removed: false,
                ended: false
            }
        );
        assert_eq!(
            sessions.get(&session.id).unwrap().status,
            SessionStatus::Waiting
        );
    }

    #[tokio::test]
    async fn end_notifies_members_once_and_keeps_them() {
        let (connections, sessions) = registry();
        let mut client_rx = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();

        assert!(matches!(
            client_rx.try_recv(),
            Ok(ServerMessage::SessionJoined { .. })
        ));

        let ended = sessions.end_session(&session.id).await.unwrap();
        let stamped = ended.ended_at;
        assert_eq!(ended.status, SessionStatus::Ended);
        assert_eq!(ended.participants.len(), 1);
        assert_eq!(
            client_rx.try_recv().ok(),
            Some(ServerMessage::SessionEnded {
                session_id: session.id.clone()
            })
        );

        let again = sessions.end_session(&session.id).await.unwrap();
        assert_eq!(again.ended_at, stamped);
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_active_is_newest_first() {
        let (_connections, sessions) = registry();
        let older = sessions.create_session("a".into(), "A".into());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = sessions.create_session("b".into(), "B".into());
        let ids: Vec<_> = sessions.list_active().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_ended_sessions() {
        let (_connections, sessions) = registry();
        let open = sessions.create_session("a".into(), "A".into());
        let closed = sessions.create_session("b".into(), "B".into());
        sessions.end_session(&closed.id).await.unwrap();

        assert!(sessions.sweep_ended(Duration::from_secs(3600)).is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sessions.sweep_ended(Duration::ZERO), vec![closed.id.clone()]);
        assert!(sessions.get(&closed.id).is_none());
        assert!(sessions.get(&open.id).is_some());
    }

    #[tokio::test]
    async fn stats_count_connections_and_members() {
        let (connections, sessions) = registry();
        let _h = connect(&connections, "h");
        let _c = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();

        let stats = sessions.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(
            stats.sessions,
            vec![SessionLoad {
                session_id: session.id,
                participant_count: 1
            }]
        );
    }

    #[tokio::test]
    async fn screen_share_requires_membership() {
        let (connections, sessions) = registry();
        let _h = connect(&connections, "h");
        let mut c_rx = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("h", "h", Role::Host))
            .await
            .unwrap();
        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();

        assert!(matches!(
            c_rx.try_recv(),
            Ok(ServerMessage::SessionJoined { .. })
        ));
        assert!(matches!(
            sessions
                .screen_share(&session.id, ConnectionId::from("x"), true)
                .await,
            Err(HubError::NotInSession(_))
        ));
        sessions
            .screen_share(&session.id, ConnectionId::from("h"), true)
            .await
            .unwrap();
        assert!(sessions.get(&session.id).unwrap().is_screen_sharing);
        assert_eq!(
            c_rx.try_recv().ok(),
            Some(ServerMessage::ScreenShareStarted {
                host_id: ConnectionId::from("h"),
                session_id: session.id.clone()
            })
        );
    }

    #[tokio::test]
    async fn joiner_hears_session_joined_before_others_hear_of_it() {
        let (connections, sessions) = registry();
        let mut host_rx = connect(&connections, "h");
        let mut client_rx = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("h", "h", Role::Host))
            .await
            .unwrap();
        assert!(matches!(
            host_rx.try_recv(),
            Ok(ServerMessage::SessionJoined { ref participants, .. }) if participants.is_empty()
        ));

        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();
        // Both frames are queued inside the same actor turn, joiner first.
        assert!(matches!(
            client_rx.try_recv(),
            Ok(ServerMessage::SessionJoined { ref participants, .. }) if participants.len() == 1
        ));
        assert!(matches!(
            host_rx.try_recv(),
            Ok(ServerMessage::ParticipantJoined { .. })
        ));
    }

    #[tokio::test]
    async fn ended_session_ignores_relay_and_screen_share() {
        let (connections, sessions) = registry();
        let mut host_rx = connect(&connections, "h");
        let mut client_rx = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("h", "h", Role::Host))
            .await
            .unwrap();
        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();
        sessions.end_session(&session.id).await.unwrap();
        while host_rx.try_recv().is_ok() {}
        while client_rx.try_recv().is_ok() {}

        sessions
            .relay(
                &session.id,
                SignalKind::Offer,
                ConnectionId::from("h"),
                ConnectionId::from("c"),
                serde_json::json!({"type": "offer", "sdp": "x"}),
            )
            .await
            .unwrap();
        assert!(matches!(
            sessions
                .screen_share(&session.id, ConnectionId::from("h"), true)
                .await,
            Err(HubError::SessionEnded(_))
        ));

        let snapshot = sessions.get(&session.id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Ended);
        assert!(!snapshot.is_screen_sharing);
        // The screen-share reply orders us after the relay command.
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejoin_with_new_role_is_announced_again() {
        let (connections, sessions) = registry();
        let mut host_rx = connect(&connections, "h");
        let _c = connect(&connections, "c");
        let session = sessions.create_session("h".into(), "H".into());
        sessions
            .join_session(&session.id, membership("h", "h", Role::Host))
            .await
            .unwrap();
        sessions
            .join_session(&session.id, membership("c", "viewer", Role::Client))
            .await
            .unwrap();
        while host_rx.try_recv().is_ok() {}

        let receipt = sessions
            .join_session(&session.id, membership("c", "viewer", Role::Host))
            .await
            .unwrap();
        assert_eq!(
            receipt.outcome,
            BindOutcome::Rejoined {
                previous_role: Role::Client
            }
        );
        assert_eq!(
            host_rx.try_recv().ok(),
            Some(ServerMessage::ParticipantLeft {
                connection_id: ConnectionId::from("c")
            })
        );
        assert_eq!(
            host_rx.try_recv().ok(),
            Some(ServerMessage::ParticipantJoined {
                connection_id: ConnectionId::from("c"),
                user_id: "viewer".into(),
                role: Role::Host,
            })
        );
    }
}
