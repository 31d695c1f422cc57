use crate::peer::transport::MediaTransport;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::{
    api::APIBuilder,
    ice_transport::{ice_gatherer_state::RTCIceGathererState, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// Сколько кандидатов держим до установки remote description
const MAX_PENDING_CANDIDATES: usize = 64;

/// Кандидаты, полученные до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingCandidates {
    /// Возвращает false, если очередь переполнена и кандидат потерян
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= MAX_PENDING_CANDIDATES {
            log::warn!("Pending candidate queue is full, dropping {}", candidate.candidate);
            return false;
        }
        self.queue.push(candidate);
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Применяет все отложенные кандидаты после установки remote description
    pub async fn flush(&mut self, transport: &dyn MediaTransport) -> usize {
        let mut applied = 0;
        for candidate in self.queue.drain(..) {
            log::debug!("Applying pending candidate: {}", candidate.candidate);
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => log::warn!("Failed to apply pending candidate: {}", e),
            }
        }
        applied
    }
}

/// Счётчики типов кандидатов
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    log::debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host,
        stats.srflx,
        stats.relay
    );

    if stats.host == 0 && stats.srflx == 0 {
        log::warn!("No host or srflx candidates gathered, the peer is unlikely to connect");
    }
    stats
}

/// Проверяет, что STUN сервер отдаёт srflx кандидата
pub async fn check_stun_server(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    log::info!("Probing ICE server '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => {
            let pc = Arc::new(pc);
            let found = check_via_ice_gathering(&pc, wait).await;
            if let Err(e) = pc.close().await {
                log::debug!("Failed to close check connection: {}", e);
            }
            found
        }
        Err(e) => {
            log::warn!("Failed to create check peer connection: {}", e);
            false
        }
    }
}

async fn check_via_ice_gathering(pc: &Arc<RTCPeerConnection>, wait: Duration) -> bool {
    let (tx, mut rx) = mpsc::channel::<bool>(10);

    let gather_tx = tx.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let tx = gather_tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                let _ = tx.send(false).await;
            }
        })
    }));

    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(init) = c.to_json() {
                    if init.candidate.contains("srflx") {
                        log::debug!("Found srflx candidate: {}", init.candidate);
                        let _ = tx.send(true).await;
                    }
                }
            }
        })
    }));

    // data channel нужен только чтобы запустить gathering
    if let Err(e) = pc.create_data_channel("stun-check", None).await {
        log::warn!("Failed to create check data channel: {}", e);
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(e) => {
            log::warn!("Failed to create check offer: {}", e);
            return false;
        }
    };
    if let Err(e) = pc.set_local_description(offer).await {
        log::warn!("Failed to set check local description: {}", e);
        return false;
    }

    match timeout(wait, rx.recv()).await {
        Ok(Some(found)) => found,
        Ok(None) => false,
        Err(_) => {
            log::info!("Timeout waiting for srflx candidate");
            false
        }
    }
}
