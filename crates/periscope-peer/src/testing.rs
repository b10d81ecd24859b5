//! In-memory connector for exercising the negotiation layer without a
//! network stack. Every call is recorded per remote; events can be injected
//! as if the underlying peer connection produced them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use periscope_proto::{ConnectionId, IceCandidate, Role, SessionDescription};

use crate::connector::{ConnectorContext, ConnectorEvent, ConnectorFactory, EventSink, PeerConnector};
use crate::error::NegotiationError;
use crate::negotiation::LinkStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

#[derive(Default)]
struct Shared {
    calls: HashMap<ConnectionId, Vec<ConnectorCall>>,
    sinks: HashMap<ConnectionId, EventSink<String>>,
    created: Vec<ConnectorContext>,
    auto_connect: bool,
}

#[derive(Clone, Default)]
pub struct MemoryConnectorFactory {
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connectors report a local candidate when their local description is
    /// set, and go `connected` (with a remote stream on the client side) once
    /// both descriptions are in place.
    pub fn with_auto_connect(self) -> Self {
        lock(&self.shared).auto_connect = true;
        self
    }

    pub fn calls(&self, remote: &ConnectionId) -> Vec<ConnectorCall> {
        lock(&self.shared)
            .calls
            .get(remote)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created(&self) -> Vec<ConnectorContext> {
        lock(&self.shared).created.clone()
    }

    /// Injects an event through the most recent connector built for `remote`.
    pub fn emit(&self, remote: &ConnectionId, event: ConnectorEvent<String>) -> bool {
        let sink = lock(&self.shared).sinks.get(remote).cloned();
        sink.is_some_and(|sink| sink.emit(event))
    }

    /// A connector that records calls but has no driver attached.
    pub fn standalone(&self, remote: ConnectionId, local_role: Role) -> MemoryConnector {
        MemoryConnector::new(remote, local_role, self.shared.clone(), None)
    }
}

#[async_trait]
impl ConnectorFactory for MemoryConnectorFactory {
    type Connector = MemoryConnector;

    async fn create(
        &self,
        context: ConnectorContext,
        events: EventSink<String>,
    ) -> Result<MemoryConnector, NegotiationError> {
        {
            let mut shared = lock(&self.shared);
            shared.created.push(context.clone());
            shared.sinks.insert(context.remote.clone(), events.clone());
        }
        Ok(MemoryConnector::new(
            context.remote,
            context.local_role,
            self.shared.clone(),
            Some(events),
        ))
    }
}

#[derive(Default)]
struct ConnectionFlags {
    local_set: bool,
    remote_set: bool,
    closed: bool,
}

pub struct MemoryConnector {
    remote: ConnectionId,
    local_role: Role,
    shared: Arc<Mutex<Shared>>,
    sink: Option<EventSink<String>>,
    flags: Mutex<ConnectionFlags>,
}

impl MemoryConnector {
    fn new(
        remote: ConnectionId,
        local_role: Role,
        shared: Arc<Mutex<Shared>>,
        sink: Option<EventSink<String>>,
    ) -> Self {
        Self {
            remote,
            local_role,
            shared,
            sink,
            flags: Mutex::new(ConnectionFlags::default()),
        }
    }

    fn record(&self, call: ConnectorCall) -> Result<(), NegotiationError> {
        lock(&self.shared)
            .calls
            .entry(self.remote.clone())
            .or_default()
            .push(call);
        let flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
        if flags.closed {
            return Err(NegotiationError::Connector("connection closed".into()));
        }
        Ok(())
    }

    fn auto_connect(&self) -> bool {
        lock(&self.shared).auto_connect
    }

    fn emit(&self, event: ConnectorEvent<String>) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn mark(&self, update: impl FnOnce(&mut ConnectionFlags)) {
        let ready = {
            let mut flags = self.flags.lock().unwrap_or_else(|p| p.into_inner());
            let before = flags.local_set && flags.remote_set;
            update(&mut flags);
            !before && flags.local_set && flags.remote_set
        };
        if ready && self.auto_connect() {
            self.emit(ConnectorEvent::LinkStatus(LinkStatus::Connecting));
            if self.local_role == Role::Client {
                self.emit(ConnectorEvent::RemoteStream(format!("stream:{}", self.remote)));
            }
            self.emit(ConnectorEvent::LinkStatus(LinkStatus::Connected));
        }
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    type Stream = String;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(ConnectorCall::CreateOffer)?;
        Ok(SessionDescription::offer(format!(
            "memory-offer:{}->{}",
            self.local_role, self.remote
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(ConnectorCall::CreateAnswer)?;
        Ok(SessionDescription::answer(format!(
            "memory-answer:{}->{}",
            self.local_role, self.remote
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.record(ConnectorCall::SetLocalDescription(desc))?;
        if self.auto_connect() {
            self.emit(ConnectorEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 9 typ host ufrag {}", self.local_role),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        self.mark(|flags| flags.local_set = true);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(ConnectorCall::SetRemoteDescription(desc))?;
        self.mark(|flags| flags.remote_set = true);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(ConnectorCall::AddIceCandidate(candidate))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record(ConnectorCall::Close)?;
        self.flags.lock().unwrap_or_else(|p| p.into_inner()).closed = true;
        Ok(())
    }
}
