//! [`PeerConnector`] backed by a real WebRTC peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use periscope_proto::{IceCandidate, Role, SdpKind, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connector::{ConnectorContext, ConnectorEvent, ConnectorFactory, EventSink, PeerConnector};
use crate::error::NegotiationError;
use crate::negotiation::LinkStatus;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
    /// Tracks a host publishes to every client it offers to.
    pub local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|url| url.to_string()).collect(),
                ..Default::default()
            }],
            local_tracks: Vec::new(),
        }
    }
}

impl RtcConfig {
    /// No STUN or TURN; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            local_tracks: Vec::new(),
        }
    }

    /// Defaults, unless `PERISCOPE_LOCALHOST_ONLY` is set.
    pub fn from_env() -> Self {
        if std::env::var("PERISCOPE_LOCALHOST_ONLY").is_ok() {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    pub fn with_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.local_tracks.push(track);
        self
    }
}

pub struct RtcConnectorFactory {
    api: API,
    config: RtcConfig,
}

impl RtcConnectorFactory {
    pub fn new(config: RtcConfig) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectorFactory for RtcConnectorFactory {
    type Connector = RtcConnector;

    async fn create(
        &self,
        context: ConnectorContext,
        events: EventSink<Arc<TrackRemote>>,
    ) -> Result<RtcConnector, NegotiationError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(ConnectorEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", remote = %sink.remote(), ?state, "peer connection state");
                if let Some(status) = link_status(state) {
                    sink.emit(ConnectorEvent::LinkStatus(status));
                }
            })
        }));

        let track_sink = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = track_sink.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", remote = %sink.remote(), kind = ?track.kind(), "remote track");
                    sink.emit(ConnectorEvent::RemoteStream(track));
                })
            },
        ));

        match context.local_role {
            Role::Client => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            }
            Role::Host if self.config.local_tracks.is_empty() => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            }
            Role::Host => {
                for track in &self.config.local_tracks {
                    pc.add_track(Arc::clone(track)).await?;
                }
            }
        }

        tracing::debug!(target = "webrtc", remote = %context.remote, role = %context.local_role, "peer connection created");
        Ok(RtcConnector { pc })
    }
}

pub struct RtcConnector {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnector for RtcConnector {
    type Stream = Arc<TrackRemote>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc.add_ice_candidate(to_rtc_candidate(candidate)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn link_status(state: RTCPeerConnectionState) -> Option<LinkStatus> {
    match state {
        RTCPeerConnectionState::New => Some(LinkStatus::New),
        RTCPeerConnectionState::Connecting => Some(LinkStatus::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkStatus::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkStatus::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkStatus::Failed),
        RTCPeerConnectionState::Closed => Some(LinkStatus::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(NegotiationError::MalformedPayload(
                "rollback descriptions are not supported".into(),
            ))
        }
    };
    Ok(converted)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Connector(
                "peer connection produced an untyped description".into(),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls.len(), 2);
        assert!(RtcConfig::localhost().ice_servers.is_empty());
    }

    #[test]
    fn rollback_is_rejected() {
        let desc = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            to_rtc_description(desc),
            Err(NegotiationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn candidate_fields_carry_over() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        assert_eq!(from_rtc_candidate(to_rtc_candidate(candidate.clone())), candidate);
    }

    #[test]
    fn unspecified_state_is_not_reported() {
        assert_eq!(link_status(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            link_status(RTCPeerConnectionState::Failed),
            Some(LinkStatus::Failed)
        );
    }

    #[tokio::test]
    async fn host_and_client_negotiate_over_loopback() {
        use crate::negotiation::Negotiator;
        use periscope_proto::ConnectionId;
        use tokio::sync::mpsc;

        let factory = RtcConnectorFactory::new(RtcConfig::localhost()).expect("factory");
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        let host_remote = ConnectionId::from("client");
        let client_remote = ConnectionId::from("host");

        let host_connector = factory
            .create(
                ConnectorContext {
                    remote: host_remote.clone(),
                    local_role: Role::Host,
                    remote_role: Role::Client,
                },
                EventSink::new(host_remote.clone(), 1, host_tx),
            )
            .await
            .expect("host connector");
        let client_connector = factory
            .create(
                ConnectorContext {
                    remote: client_remote.clone(),
                    local_role: Role::Client,
                    remote_role: Role::Host,
                },
                EventSink::new(client_remote.clone(), 1, client_tx),
            )
            .await
            .expect("client connector");

        let mut host = Negotiator::new(host_remote, Role::Host, 1, host_connector);
        let mut client = Negotiator::new(client_remote, Role::Client, 1, client_connector);

        let offer = host.create_offer().await.expect("offer");
        assert!(offer.sdp.contains("m=video"));
        let answer = client.accept_offer(&offer.to_payload()).await.expect("answer");
        assert_eq!(answer.kind, SdpKind::Answer);
        host.accept_answer(&answer.to_payload()).await.expect("apply answer");

        host.close().await;
        client.close().await;
    }
}
