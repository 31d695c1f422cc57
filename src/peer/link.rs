use crate::peer::ice::PendingCandidates;
use crate::peer::media::{LocalStream, RemoteStream};
use crate::peer::state::LinkState;
use crate::peer::transport::{MediaTransport, SignalingState};
use crate::peer::types::{IceCandidate, Role};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Одно соединение с собеседником.
///
/// Принадлежит только `PeerManager` одной машины состояний.
pub struct PeerLink {
    peer_id: String,
    role: Role,
    generation: u64,
    state: LinkState,
    transport: Arc<dyn MediaTransport>,
    local_stream: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    pending: PendingCandidates,
    local_candidates: Vec<IceCandidate>,
    /// метка запроса зрителя, которой помечаются сигналы соединения
    request_id: Option<u64>,
    deadline: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl PeerLink {
    pub(crate) fn new(peer_id: String, role: Role, generation: u64, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            peer_id,
            role,
            generation,
            state: LinkState::New,
            transport,
            local_stream: None,
            remote_stream: None,
            pending: PendingCandidates::default(),
            local_candidates: Vec::new(),
            request_id: None,
            deadline: None,
            created_at: Instant::now(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.transport.signaling_state()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Свои кандидаты, отданные собеседнику
    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    pub(crate) fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            log::debug!("Link {}#{}: {} -> {}", self.peer_id, self.generation, self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn set_request_id(&mut self, request_id: Option<u64>) {
        self.request_id = request_id;
    }

    pub(crate) fn set_local_stream(&mut self, stream: LocalStream) {
        self.local_stream = Some(stream);
    }

    /// Запоминает только первый поток
    pub(crate) fn set_remote_stream(&mut self, stream: RemoteStream) -> bool {
        if self.remote_stream.is_some() {
            stream.detach();
            return false;
        }
        self.remote_stream = Some(stream);
        true
    }

    pub(crate) fn record_local_candidate(&mut self, candidate: IceCandidate) {
        self.local_candidates.push(candidate);
    }

    pub(crate) fn arm_deadline(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.deadline.replace(handle) {
            old.abort();
        }
    }

    pub(crate) fn disarm_deadline(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }

    /// Применяет кандидат сразу или откладывает до remote description
    pub(crate) async fn add_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.transport.has_remote_description().await {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                log::warn!("Failed to add ICE candidate for {}: {}", self.peer_id, e);
            }
        } else {
            log::debug!("Remote description not set yet for {}, queuing candidate", self.peer_id);
            self.pending.push(candidate);
        }
    }

    pub(crate) async fn flush_candidates(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let applied = self.pending.flush(self.transport.as_ref()).await;
        log::debug!("Applied {} pending candidates for {}", applied, self.peer_id);
    }

    /// Закрывает транспорт; общий поток захвата не останавливается.
    /// Возвращает remote stream, если он был (его нужно отвязать от рендера).
    pub(crate) async fn close(&mut self) -> Option<RemoteStream> {
        if self.state == LinkState::Closed {
            return None;
        }
        self.disarm_deadline();
        self.pending.clear();
        if let Err(e) = self.transport.close().await {
            log::debug!("Transport close for {} reported: {}", self.peer_id, e);
        }
        self.local_stream = None;
        self.set_state(LinkState::Closed);
        let remote = self.remote_stream.take();
        if let Some(stream) = &remote {
            stream.detach();
        }
        remote
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.disarm_deadline();
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("request_id", &self.request_id)
            .field("state", &self.state)
            .field("local_stream", &self.local_stream)
            .field("remote_stream", &self.remote_stream)
            .field("pending", &self.pending.len())
            .finish()
    }
}
