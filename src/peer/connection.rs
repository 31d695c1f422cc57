use crate::errors::TransportError;
use crate::logger::dump_candidate;
use crate::peer::media::{LocalStream, RemotePacket, RemoteStream};
use crate::peer::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportEventSink, TransportFactory, TransportState,
};
use crate::peer::types::{IceCandidate, Role, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// Фабрика webrtc-rs соединений (только STUN, без TURN)
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(servers: &[ServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers_from_config(servers),
        }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// Получение конфигурации серверов из настроек
pub fn ice_servers_from_config(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);
        wire_handlers(&pc, peer_id, role, events);
        Ok(Arc::new(RtcTransport { pc }))
    }
}

/// создаём обработчики; колбэки уходят в канал машины с номером поколения
fn wire_handlers(pc: &Arc<RTCPeerConnection>, peer_id: &str, role: Role, events: TransportEventSink) {
    let label = peer_id.to_owned();
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        let label = label.clone();
        Box::pin(async move {
            match cand {
                Some(c) => {
                    dump_candidate(&label, &c);
                    match c.to_json() {
                        Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate::from(init))),
                        Err(e) => log::warn!("Failed to serialize local candidate: {}", e),
                    }
                }
                // cand == None означает конец сбора
                None => sink.emit(TransportEvent::GatheringComplete),
            }
        })
    }));

    let sink = events.clone();
    let label = peer_id.to_owned();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log::info!("Peer connection {} state changed to: {:?}", label, st);
        let mapped = match st {
            RTCPeerConnectionState::New => Some(TransportState::New),
            RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
            RTCPeerConnectionState::Connected => Some(TransportState::Connected),
            RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
            RTCPeerConnectionState::Failed => Some(TransportState::Failed),
            RTCPeerConnectionState::Closed => Some(TransportState::Closed),
            _ => None,
        };
        if let Some(state) = mapped {
            sink.emit(TransportEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    if role == Role::Receiver {
        // только первый сгруппированный поток
        let seen = Arc::new(AtomicBool::new(false));
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if !seen.swap(true, Ordering::SeqCst) {
                let stream = RemoteStream::with_tracks(track.stream_id(), vec![track.clone()]);
                tokio::spawn(read_track(track, stream.clone()));
                events.emit(TransportEvent::RemoteStream(stream));
            }
            Box::pin(async {})
        }));
    }
}

/// Читает RTP трека, пока поток не отвязан или трек не закрыт
async fn read_track(track: Arc<TrackRemote>, stream: RemoteStream) {
    let detached = stream.detached();
    tokio::pin!(detached);
    loop {
        tokio::select! {
            _ = &mut detached => break,
            read = track.read_rtp() => match read {
                Ok((packet, _)) => {
                    let packet = RemotePacket {
                        sequence: packet.header.sequence_number,
                        timestamp: packet.header.timestamp,
                        marker: packet.header.marker,
                        payload: packet.payload,
                    };
                    if !stream.push(packet) {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("track {} read ended: {}", stream.stream_id, e);
                    break;
                }
            },
        }
    }
    log::debug!("stopped reading stream {}", stream.stream_id);
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    async fn local_description(&self) -> Result<SessionDescription, TransportError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::InvalidDescription("local description missing".into()))?;
        to_description(desc)
    }
}

fn to_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::InvalidDescription(format!(
                "unexpected sdp type {}",
                other
            )))
        }
    };
    Ok(SessionDescription { kind, sdp: desc.sdp })
}

fn from_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            let sender = self
                .pc
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP надо вычитывать, иначе interceptors не работают
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        self.pc.set_remote_description(from_description(offer)?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(from_description(answer)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}
