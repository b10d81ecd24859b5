//! Live transport connections and their session association.
//!
//! Records are plain data behind a sharded map; no method awaits while a
//! shard guard is held.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use periscope_proto::{ConnectionId, Role, ServerMessage, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::HubError;

pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// What a connection announced when it joined a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub session_id: SessionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub role: Role,
}

struct ConnectionRecord {
    outbound: Outbound,
    association: Option<Association>,
    last_heartbeat: Instant,
    remote_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub association: Option<Association>,
    pub last_heartbeat: Instant,
    pub remote_addr: Option<SocketAddr>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the id was already registered; the existing record is kept.
    pub fn register(
        &self,
        id: ConnectionId,
        outbound: Outbound,
        remote_addr: Option<SocketAddr>,
    ) -> bool {
        let mut inserted = false;
        self.connections.entry(id.clone()).or_insert_with(|| {
            inserted = true;
            ConnectionRecord {
                outbound,
                association: None,
                last_heartbeat: Instant::now(),
                remote_addr,
            }
        });
        if inserted {
            debug!(connection = %id, "connection registered");
        }
        inserted
    }

    pub fn associate(&self, id: &ConnectionId, association: Association) -> Result<(), HubError> {
        let mut record = self
            .connections
            .get_mut(id)
            .ok_or_else(|| HubError::UnknownConnection(id.clone()))?;
        record.association = Some(association);
        Ok(())
    }

    pub fn disassociate(&self, id: &ConnectionId) -> Option<Association> {
        self.connections
            .get_mut(id)
            .and_then(|mut record| record.association.take())
    }

    /// Clears the association only while it still points at `session_id`.
    pub fn disassociate_from(&self, id: &ConnectionId, session_id: &SessionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut record) => {
                let matches = record
                    .association
                    .as_ref()
                    .is_some_and(|assoc| &assoc.session_id == session_id);
                if matches {
                    record.association = None;
                }
                matches
            }
            None => false,
        }
    }

    pub fn deregister(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        let (id, record) = self.connections.remove(id)?;
        if let Some(assoc) = &record.association {
            warn!(
                connection = %id,
                session = %assoc.session_id,
                "deregistering a connection that is still in a session"
            );
        }
        debug!(connection = %id, "connection deregistered");
        Some(ConnectionSnapshot {
            id,
            association: record.association,
            last_heartbeat: record.last_heartbeat,
            remote_addr: record.remote_addr,
        })
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        self.connections.get(id).map(|record| ConnectionSnapshot {
            id: id.clone(),
            association: record.association.clone(),
            last_heartbeat: record.last_heartbeat,
            remote_addr: record.remote_addr,
        })
    }

    pub fn association(&self, id: &ConnectionId) -> Option<Association> {
        self.connections
            .get(id)
            .and_then(|record| record.association.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut record) => {
                record.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections whose last heartbeat is older than `timeout`.
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.last_heartbeat.elapsed() > timeout)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Queues `message` on the connection's writer. Returns false if the
    /// connection is gone or its writer has stopped.
    pub fn send(&self, id: &ConnectionId, message: ServerMessage) -> bool {
        let Some(outbound) = self
            .connections
            .get(id)
            .map(|record| record.outbound.clone())
        else {
            debug!(connection = %id, kind = message.kind(), "dropping message for unknown connection");
            return false;
        };
        outbound.send(message).is_ok()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assoc(session: &str, role: Role) -> Association {
        Association {
            session_id: SessionId::from(session),
            user_id: "user".into(),
            device_id: None,
            role,
        }
    }

    #[test]
    fn associate_requires_registration() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::from("c1");
        assert_eq!(
            registry.associate(&id, assoc("s", Role::Client)),
            Err(HubError::UnknownConnection(id.clone()))
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.register(id.clone(), tx, None));
        registry
            .associate(&id, assoc("s", Role::Client))
            .expect("associate");
        assert_eq!(
            registry.association(&id).map(|a| a.role),
            Some(Role::Client)
        );

        registry.deregister(&id);
        assert!(registry.associate(&id, assoc("s", Role::Client)).is_err());
    }

    #[test]
    fn reregistering_keeps_existing_record() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::from("c1");
        let (first, mut first_rx) = mpsc::unbounded_channel();
        let (second, _second_rx) = mpsc::unbounded_channel();
        assert!(registry.register(id.clone(), first, None));
        assert!(!registry.register(id.clone(), second, None));

        assert!(registry.send(&id, ServerMessage::Pong));
        assert_eq!(first_rx.try_recv().ok(), Some(ServerMessage::Pong));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disassociate_from_ignores_other_sessions() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::from("c1");
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(id.clone(), tx, None);
        registry.associate(&id, assoc("b", Role::Host)).unwrap();

        assert!(!registry.disassociate_from(&id, &SessionId::from("a")));
        assert!(registry.association(&id).is_some());
        assert!(registry.disassociate_from(&id, &SessionId::from("b")));
        assert!(registry.association(&id).is_none());
    }

    #[test]
    fn stale_lists_only_expired_connections() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(ConnectionId::from("c1"), tx, None);

        assert!(registry.stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            registry.stale(Duration::from_millis(1)),
            vec![ConnectionId::from("c1")]
        );
        registry.touch(&ConnectionId::from("c1"));
        assert!(registry.stale(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn send_reports_closed_writer() {
        let registry = ConnectionRegistry::new();
        let id = ConnectionId::from("c1");
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id.clone(), tx, None);
        drop(rx);
        assert!(!registry.send(&id, ServerMessage::Pong));
        assert!(!registry.send(&ConnectionId::from("missing"), ServerMessage::Pong));
    }
}
