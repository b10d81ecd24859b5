//! Per-session routing group.
//!
//! Members are keyed by a participant id; the connection a participant
//! currently uses is looked up through an indirection table on every relay, so
//! a reconnecting participant can take over its slot without leaving. Only
//! participants that name their device can be resumed that way.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use periscope_proto::{ConnectionId, ParticipantInfo, Role};

/// Identity of a participant inside one session. With a device id it is
/// stable across connections; without one it is tied to the connection, so
/// two tabs of the same user stay separate members.
pub fn participant_key(
    user_id: &str,
    device_id: Option<&str>,
    connection_id: &ConnectionId,
) -> String {
    match device_id {
        Some(device) if !device.is_empty() => format!("{user_id}:{device}"),
        _ => format!("{user_id}@{connection_id}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub participant_id: String,
    pub participant_name: String,
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub device_id: Option<String>,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.connection_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// New participant appended at the end of the join order.
    Joined,
    /// Same participant on the same connection. The stored role is replaced
    /// by the requested one.
    Rejoined { previous_role: Role },
    /// Participant moved from `previous` to the new connection.
    Resumed { previous: ConnectionId },
}

#[derive(Debug, Default)]
pub struct RoutingGroup {
    members: Vec<Member>,
    /// connection id -> participant id, for current and retired connections.
    routes: HashMap<ConnectionId, String>,
}

impl RoutingGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, member: Member) -> BindOutcome {
        let connection_id = member.connection_id.clone();
        let participant_id = member.participant_id.clone();

        let Some(index) = self
            .members
            .iter()
            .position(|m| m.participant_id == participant_id)
        else {
            self.routes.insert(connection_id, participant_id);
            self.members.push(member);
            return BindOutcome::Joined;
        };
        let existing = &mut self.members[index];

        if existing.connection_id == connection_id {
            let previous_role = std::mem::replace(&mut existing.role, member.role);
            existing.participant_name = member.participant_name;
            return BindOutcome::Rejoined { previous_role };
        }

        let previous = std::mem::replace(&mut existing.connection_id, connection_id.clone());
        existing.role = member.role;
        existing.participant_name = member.participant_name;
        // The retired id keeps routing to the participant until it leaves.
        self.routes.insert(connection_id, participant_id);
        BindOutcome::Resumed { previous }
    }

    /// Removes the member currently reachable through `connection_id`.
    /// Retired connection ids of a resumed participant do not remove it.
    pub fn unbind(&mut self, connection_id: &ConnectionId) -> Option<Member> {
        let index = self
            .members
            .iter()
            .position(|m| &m.connection_id == connection_id)?;
        let member = self.members.remove(index);
        self.routes
            .retain(|_, participant| participant != &member.participant_id);
        Some(member)
    }

    /// Current connection for whoever `target` addresses, following retired ids.
    pub fn resolve(&self, target: &ConnectionId) -> Option<&ConnectionId> {
        let participant = self.routes.get(target)?;
        self.members
            .iter()
            .find(|m| &m.participant_id == participant)
            .map(|m| &m.connection_id)
    }

    pub fn is_current(&self, connection_id: &ConnectionId) -> bool {
        self.members.iter().any(|m| &m.connection_id == connection_id)
    }

    pub fn member(&self, connection_id: &ConnectionId) -> Option<&Member> {
        self.members.iter().find(|m| &m.connection_id == connection_id)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn connections_except<'a>(
        &'a self,
        exclude: &'a ConnectionId,
    ) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.members
            .iter()
            .map(|m| &m.connection_id)
            .filter(move |id| *id != exclude)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
