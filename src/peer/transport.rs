//! Граница медиа-транспорта: offer/answer/ICE примитивы.
//!
//! Машины состояний работают только через эти трейты. Реализация на
//! webrtc-rs лежит в `peer::connection`, тесты подставляют свою.

use crate::errors::TransportError;
use crate::peer::media::{LocalStream, RemoteStream};
use crate::peer::types::{IceCandidate, Role, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Состояние согласования SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Состояние транспорта (ICE/DTLS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(TransportState),
    RemoteStream(RemoteStream),
}

/// Событие соединения, помеченное поколением
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer_id: String,
    pub generation: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    Transport(TransportEvent),
    DeadlineElapsed,
}

/// Куда транспорт шлёт свои колбэки
#[derive(Clone)]
pub struct TransportEventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl TransportEventSink {
    pub fn new(peer_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        self.send(LinkEventKind::Transport(event));
    }

    pub(crate) fn send(&self, kind: LinkEventKind) {
        // машина уже остановлена - событие никому не нужно
        let _ = self.tx.send(LinkEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            kind,
        });
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Добавляет все треки потока как один сгруппированный поток
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), TransportError>;

    /// Создаёт offer и ставит его как local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Ставит remote offer, создаёт answer и ставит его как local description
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
