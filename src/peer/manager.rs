//! Арена соединений одной машины состояний.
//!
//! Ключ - id собеседника, на каждого не больше одного живого `PeerLink`.
//! Колбэки транспорта и таймеры приходят через канал с номером поколения;
//! всё, что относится к закрытому или заменённому соединению, игнорируется.

use crate::errors::{DropReason, Outcome, TransportError};
use crate::peer::ice::analyze_candidates;
use crate::peer::link::PeerLink;
use crate::peer::media::{LocalStream, RemoteStream};
use crate::peer::state::LinkState;
use crate::peer::transport::{
    LinkEvent, LinkEventKind, SignalingState, TransportEvent, TransportEventSink, TransportFactory,
    TransportState,
};
use crate::peer::types::{IceCandidate, Role, SessionDescription};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Почему соединение закрыто
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    TimedOut,
    TransportFailed,
    TransportClosed,
}

#[derive(Debug)]
pub struct ClosedLink {
    pub peer_id: String,
    pub generation: u64,
    pub reason: CloseReason,
    /// поток, который надо отвязать от рендера
    pub remote_stream: Option<RemoteStream>,
}

/// Что машина состояний должна сделать после события транспорта
#[derive(Debug)]
pub enum LinkUpdate {
    LocalCandidate { peer_id: String, candidate: IceCandidate },
    Connected { peer_id: String },
    RemoteStream { peer_id: String, stream: RemoteStream },
    Problem { peer_id: String },
    Closed(ClosedLink),
}

/// Краткое состояние соединения для UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub peer_id: String,
    pub state: LinkState,
    pub generation: u64,
}

pub struct PeerManager {
    factory: Arc<dyn TransportFactory>,
    links: HashMap<String, PeerLink>,
    next_generation: u64,
    deadline: Option<Duration>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl PeerManager {
    pub fn new(factory: Arc<dyn TransportFactory>, deadline: Option<Duration>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            links: HashMap::new(),
            next_generation: 1,
            deadline,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Забирает приёмник событий для цикла машины
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.take()
    }

    /// Следующее уже пришедшее событие, если приёмник ещё не забран
    pub fn try_next_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn peer_ids(&self) -> BTreeSet<String> {
        self.links.keys().cloned().collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    /// Сводка по соединениям, по id пира
    pub fn summaries(&self) -> Vec<LinkSummary> {
        let mut out: Vec<LinkSummary> = self
            .links
            .values()
            .map(|link| LinkSummary {
                peer_id: link.peer_id().to_owned(),
                state: link.state(),
                generation: link.generation(),
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Создаёт соединение, закрывая прежнее для того же пира
    pub async fn create(&mut self, peer_id: &str, role: Role) -> Result<u64, TransportError> {
        if let Some(replaced) = self.close(peer_id).await {
            log::info!("Replacing link {}#{}", peer_id, replaced.generation);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = TransportEventSink::new(peer_id, generation, self.events_tx.clone());
        let transport = self.factory.create(peer_id, role, sink.clone()).await?;
        let mut link = PeerLink::new(peer_id.to_owned(), role, generation, transport);

        if let Some(deadline) = self.deadline {
            let handle = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                sink.send(LinkEventKind::DeadlineElapsed);
            });
            link.arm_deadline(handle);
        }

        log::info!("Created {:?} link {}#{}", role, peer_id, generation);
        self.links.insert(peer_id.to_owned(), link);
        Ok(generation)
    }

    pub(crate) fn set_state(&mut self, peer_id: &str, state: LinkState) {
        if let Some(link) = self.links.get_mut(peer_id) {
            link.set_state(state);
        }
    }

    /// Метка запроса, которой помечаются сигналы соединения
    pub fn set_request_id(&mut self, peer_id: &str, request_id: Option<u64>) {
        if let Some(link) = self.links.get_mut(peer_id) {
            link.set_request_id(request_id);
        }
    }

    pub fn request_id(&self, peer_id: &str) -> Option<u64> {
        self.links.get(peer_id).and_then(PeerLink::request_id)
    }

    pub async fn attach_local_stream(
        &mut self,
        peer_id: &str,
        stream: &LocalStream,
    ) -> Result<Outcome<()>, TransportError> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(Outcome::Dropped(DropReason::OrphanSignal));
        };
        link.transport().add_local_stream(stream).await?;
        link.set_local_stream(stream.clone());
        Ok(Outcome::Applied(()))
    }

    pub async fn create_offer(&mut self, peer_id: &str) -> Result<Outcome<SessionDescription>, TransportError> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(Outcome::Dropped(DropReason::OrphanSignal));
        };
        let offer = link.transport().create_offer().await?;
        link.set_state(LinkState::Negotiating);
        Ok(Outcome::Applied(offer))
    }

    /// Отвечает на offer. Если согласование не в stable - ничего не делает.
    pub async fn create_answer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<Outcome<SessionDescription>, TransportError> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(Outcome::Dropped(DropReason::OrphanSignal));
        };
        if !link.state().accepts_offer() || link.signaling_state() != SignalingState::Stable {
            log::debug!(
                "Ignoring offer for {}#{}: state={} signaling={:?}",
                peer_id,
                link.generation(),
                link.state(),
                link.signaling_state()
            );
            return Ok(Outcome::Dropped(DropReason::NegotiationConflict));
        }

        let answer = link.transport().accept_offer(offer).await?;
        link.set_state(LinkState::Negotiating);
        link.flush_candidates().await;
        Ok(Outcome::Applied(answer))
    }

    pub async fn apply_answer(
        &mut self,
        peer_id: &str,
        answer: SessionDescription,
    ) -> Result<Outcome<()>, TransportError> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(Outcome::Dropped(DropReason::OrphanSignal));
        };
        if link.role() != Role::Sender || link.signaling_state() != SignalingState::HaveLocalOffer {
            log::debug!(
                "Ignoring answer for {}#{}: signaling={:?}",
                peer_id,
                link.generation(),
                link.signaling_state()
            );
            return Ok(Outcome::Dropped(DropReason::NegotiationConflict));
        }

        link.transport().accept_answer(answer).await?;
        link.flush_candidates().await;
        Ok(Outcome::Applied(()))
    }

    /// Кандидат принимается в любом состоянии соединения
    pub async fn add_ice_candidate(&mut self, peer_id: &str, candidate: IceCandidate) -> Outcome<()> {
        match self.links.get_mut(peer_id) {
            Some(link) => {
                link.add_ice_candidate(candidate).await;
                Outcome::Applied(())
            }
            None => Outcome::Dropped(DropReason::OrphanSignal),
        }
    }

    pub async fn close(&mut self, peer_id: &str) -> Option<ClosedLink> {
        self.close_with(peer_id, CloseReason::Requested).await
    }

    pub async fn close_all(&mut self) -> Vec<ClosedLink> {
        let mut peers: Vec<String> = self.links.keys().cloned().collect();
        peers.sort();
        let mut closed = Vec::with_capacity(peers.len());
        for peer_id in peers {
            if let Some(c) = self.close(&peer_id).await {
                closed.push(c);
            }
        }
        closed
    }

    async fn close_with(&mut self, peer_id: &str, reason: CloseReason) -> Option<ClosedLink> {
        let mut link = self.links.remove(peer_id)?;
        let remote_stream = link.close().await;
        log::info!("Closed link {}#{} ({:?})", peer_id, link.generation(), reason);
        Some(ClosedLink {
            peer_id: peer_id.to_owned(),
            generation: link.generation(),
            reason,
            remote_stream,
        })
    }

    pub async fn handle_event(&mut self, event: LinkEvent) -> Option<LinkUpdate> {
        let LinkEvent {
            peer_id,
            generation,
            kind,
        } = event;

        let link = match self.links.get_mut(&peer_id) {
            Some(link) if link.generation() == generation => link,
            _ => {
                log::debug!("Dropping event for stale link {}#{}: {:?}", peer_id, generation, kind);
                if let LinkEventKind::Transport(TransportEvent::RemoteStream(stream)) = &kind {
                    stream.detach();
                }
                return None;
            }
        };

        match kind {
            LinkEventKind::Transport(TransportEvent::LocalCandidate(candidate)) => {
                link.record_local_candidate(candidate.clone());
                Some(LinkUpdate::LocalCandidate { peer_id, candidate })
            }
            LinkEventKind::Transport(TransportEvent::GatheringComplete) => {
                log::debug!("ICE gathering complete for {}#{}", peer_id, generation);
                analyze_candidates(link.local_candidates());
                None
            }
            LinkEventKind::Transport(TransportEvent::RemoteStream(stream)) => {
                if !link.set_remote_stream(stream.clone()) {
                    return None;
                }
                link.disarm_deadline();
                link.set_state(LinkState::Connected);
                Some(LinkUpdate::RemoteStream { peer_id, stream })
            }
            LinkEventKind::Transport(TransportEvent::StateChanged(state)) => match state {
                TransportState::Connected => {
                    link.disarm_deadline();
                    if link.state() == LinkState::Connected {
                        return None;
                    }
                    link.set_state(LinkState::Connected);
                    Some(LinkUpdate::Connected { peer_id })
                }
                TransportState::Disconnected => {
                    log::warn!("Link {}#{} disconnected, waiting for recovery", peer_id, generation);
                    Some(LinkUpdate::Problem { peer_id })
                }
                TransportState::Failed => self
                    .close_with(&peer_id, CloseReason::TransportFailed)
                    .await
                    .map(LinkUpdate::Closed),
                TransportState::Closed => self
                    .close_with(&peer_id, CloseReason::TransportClosed)
                    .await
                    .map(LinkUpdate::Closed),
                TransportState::New | TransportState::Connecting => None,
            },
            LinkEventKind::DeadlineElapsed => {
                if link.state() == LinkState::Connected {
                    return None;
                }
                log::warn!(
                    "Link {}#{} did not connect in time (state={}, age={:?})",
                    peer_id,
                    generation,
                    link.state(),
                    link.age()
                );
                self.close_with(&peer_id, CloseReason::TimedOut)
                    .await
                    .map(LinkUpdate::Closed)
            }
        }
    }
}
