//! Машина состояний преподавателя: принимает экраны студентов.
//!
//! Режимы: `layout` (ничего не смотрим), `single` (один студент крупно),
//! `grid` (все, кто транслирует). Переключение режима сначала закрывает
//! соединения прежнего режима.

pub mod grid;

use self::grid::{diff, GridAction};
use crate::config::Settings;
use crate::errors::{DropReason, Error, Outcome, Result};
use crate::logger::{AppEvent, Emitter, MediaFrame};
use crate::peer::manager::{CloseReason, ClosedLink, LinkSummary, LinkUpdate, PeerManager};
use crate::peer::media::{RemotePacket, RemoteStream};
use crate::peer::state::LinkState;
use crate::peer::transport::{LinkEvent, TransportFactory};
use crate::peer::types::Role;
use crate::session::{sharing_peers, LabSession, Presence, SessionSubscription};
use crate::signaling::{check_fresh, Inbox, InboxSubscription, SeenSignals, Signal, SignalMessage, SignalRelay};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Layout,
    Single,
    Grid,
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViewMode::Layout => "layout",
            ViewMode::Single => "single",
            ViewMode::Grid => "grid",
        };
        f.write_str(s)
    }
}

/// Состояние для UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSnapshot {
    pub mode: ViewMode,
    pub single: Option<String>,
    pub grid: Vec<String>,
    pub sharing: Vec<String>,
    pub links: Vec<LinkSummary>,
}

pub struct ViewerMachine {
    session_id: String,
    self_id: String,
    relay: SignalRelay,
    peers: PeerManager,
    emitter: Emitter,
    stale_after: Duration,
    mode: ViewMode,
    single: Option<String>,
    grid: BTreeSet<String>,
    sharing: BTreeSet<String>,
    seen: SeenSignals,
    ended: bool,
}

impl ViewerMachine {
    pub fn new(
        session_id: impl Into<String>,
        self_id: impl Into<String>,
        relay: SignalRelay,
        factory: Arc<dyn TransportFactory>,
        emitter: Emitter,
        settings: &Settings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id: self_id.into(),
            relay,
            peers: PeerManager::new(factory, settings.negotiation_deadline()),
            emitter,
            stale_after: settings.stale_after(),
            mode: ViewMode::Layout,
            single: None,
            grid: BTreeSet::new(),
            sharing: BTreeSet::new(),
            seen: SeenSignals::new(),
            ended: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn single(&self) -> Option<&str> {
        self.single.as_deref()
    }

    pub fn grid(&self) -> &BTreeSet<String> {
        &self.grid
    }

    /// Последний известный набор транслирующих студентов
    pub fn sharing(&self) -> &BTreeSet<String> {
        &self.sharing
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.peers.get(peer_id).map(|link| link.state())
    }

    pub fn link_count(&self) -> usize {
        self.peers.len()
    }

    pub fn snapshot(&self) -> ViewerSnapshot {
        ViewerSnapshot {
            mode: self.mode,
            single: self.single.clone(),
            grid: self.grid.iter().cloned().collect(),
            sharing: self.sharing.iter().cloned().collect(),
            links: self.peers.summaries(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.ended {
            return Err(Error::InvalidRequest("session has ended".into()));
        }
        Ok(())
    }

    fn switch_mode(&mut self, mode: ViewMode) {
        if self.mode != mode {
            log::info!("View mode {} -> {}", self.mode, mode);
            self.mode = mode;
            self.emitter.emit(AppEvent::ModeChanged {
                mode: mode.to_string(),
            });
        }
    }

    /// Создаёт принимающее соединение (заменяя прежнее) и шлёт view_request.
    /// Запрос помечен поколением соединения; ответы на прежние запросы отбрасываются.
    pub(crate) async fn request_view(&mut self, peer_id: &str) -> Result<()> {
        self.ensure_running()?;
        let generation = self.peers.create(peer_id, Role::Receiver).await?;
        self.peers.set_state(peer_id, LinkState::Requesting);
        self.peers.set_request_id(peer_id, Some(generation));

        let request =
            Signal::new(self.self_id.as_str(), peer_id, SignalMessage::ViewRequest).with_request(Some(generation));
        let sent = self.relay.send_signal(&self.session_id, &request).await;
        if let Err(e) = sent {
            self.close_link(peer_id).await;
            return Err(e.into());
        }

        log::info!("Requested view of {} (request {})", peer_id, generation);
        self.emitter.emit(AppEvent::ViewRequested {
            peer_id: peer_id.to_owned(),
        });
        Ok(())
    }

    /// Крупный план одного студента
    pub async fn view_single(&mut self, peer_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.close_grid().await;
        if let Some(previous) = self.single.take() {
            self.close_link(&previous).await;
        }

        match self.request_view(peer_id).await {
            Ok(()) => {
                self.single = Some(peer_id.to_owned());
                self.switch_mode(ViewMode::Single);
                Ok(())
            }
            Err(e) => {
                self.switch_mode(ViewMode::Layout);
                Err(e)
            }
        }
    }

    pub async fn close_single(&mut self) {
        if let Some(peer_id) = self.single.take() {
            self.close_link(&peer_id).await;
        }
        if self.mode == ViewMode::Single {
            self.switch_mode(ViewMode::Layout);
        }
    }

    /// `single` включается только через `view_single`
    pub async fn set_mode(&mut self, mode: ViewMode) -> Result<()> {
        self.ensure_running()?;
        match mode {
            ViewMode::Single => Err(Error::InvalidRequest(
                "single mode needs a peer, use view_single".into(),
            )),
            ViewMode::Layout => {
                self.close_single().await;
                self.close_grid().await;
                for closed in self.peers.close_all().await {
                    self.report_closed(&closed);
                }
                self.switch_mode(ViewMode::Layout);
                Ok(())
            }
            ViewMode::Grid => {
                if let Some(peer_id) = self.single.take() {
                    self.close_link(&peer_id).await;
                }
                self.switch_mode(ViewMode::Grid);
                self.reconcile_grid().await;
                Ok(())
            }
        }
    }

    /// Новый снимок сессии от слоя присутствия
    pub async fn on_presence(&mut self, session: Option<LabSession>) {
        if self.ended {
            return;
        }
        if let Some(session) = session.as_ref().filter(|s| s.is_ended()) {
            log::info!("Session {} ended, tearing down viewer", session.session_id);
            self.shutdown().await;
            self.ended = true;
            self.emitter.emit(AppEvent::SessionEnded);
            return;
        }

        let sharing = session.map(|s| sharing_peers(&s.seats)).unwrap_or_default();
        let previous = std::mem::replace(&mut self.sharing, sharing);

        match self.mode {
            ViewMode::Grid => self.reconcile_grid().await,
            ViewMode::Single => {
                let stopped = self
                    .single
                    .as_ref()
                    .is_some_and(|p| previous.contains(p) && !self.sharing.contains(p));
                if stopped {
                    log::info!("Spotlighted peer stopped sharing");
                    self.close_single().await;
                }
            }
            ViewMode::Layout => {}
        }
    }

    async fn reconcile_grid(&mut self) {
        for action in diff(&self.grid, &self.sharing) {
            match action {
                GridAction::Close(peer_id) => {
                    self.grid.remove(&peer_id);
                    self.close_link(&peer_id).await;
                }
                GridAction::Open(peer_id) => match self.request_view(&peer_id).await {
                    Ok(()) => {
                        self.grid.insert(peer_id);
                    }
                    Err(e) => self
                        .emitter
                        .emit_error(format!("Could not open grid view of {}: {}", peer_id, e)),
                },
            }
        }
    }

    async fn close_grid(&mut self) {
        for peer_id in std::mem::take(&mut self.grid) {
            self.close_link(&peer_id).await;
        }
    }

    async fn close_link(&mut self, peer_id: &str) -> bool {
        match self.peers.close(peer_id).await {
            Some(closed) => {
                self.report_closed(&closed);
                true
            }
            None => false,
        }
    }

    fn report_closed(&self, closed: &ClosedLink) {
        if closed.remote_stream.is_some() {
            self.emitter.emit_detached(&closed.peer_id);
        }
        if closed.reason == CloseReason::TimedOut {
            self.emitter.emit(AppEvent::ConnectionTimedOut {
                peer_id: closed.peer_id.clone(),
            });
        }
        self.emitter.emit(AppEvent::LinkClosed {
            peer_id: closed.peer_id.clone(),
        });
    }

    /// Соединение закрылось само (таймаут, сбой транспорта)
    fn link_lost(&mut self, closed: ClosedLink) {
        self.report_closed(&closed);
        if self.grid.remove(&closed.peer_id) {
            // повторная попытка только при следующем обновлении присутствия
            self.emitter.emit(AppEvent::GridTileLost {
                peer_id: closed.peer_id.clone(),
            });
        }
        if self.single.as_deref() == Some(closed.peer_id.as_str()) {
            self.single = None;
            self.switch_mode(ViewMode::Layout);
        }
    }

    /// Обрабатывает новые сигналы снимка и подтверждает каждый
    pub async fn handle_inbox(&mut self, inbox: &Inbox) -> usize {
        if self.ended {
            return 0;
        }
        let fresh = self.seen.unseen(inbox);
        let count = fresh.len();
        for envelope in fresh {
            let signal = &envelope.signal;
            match self.handle_signal(signal).await {
                Ok(Outcome::Applied(())) => {}
                Ok(Outcome::Dropped(reason)) => {
                    log::debug!("Dropped {} from {}: {}", signal.kind(), signal.from_id, reason)
                }
                Err(e) => self
                    .emitter
                    .emit_error(format!("Failed to handle {} from {}: {}", signal.kind(), signal.from_id, e)),
            }
            if let Err(e) = self.relay.ack(&self.session_id, &self.self_id, &envelope).await {
                log::warn!("Failed to ack signal {}: {}", envelope.key, e);
            }
        }
        count
    }

    /// Разовое чтение ящика
    pub async fn poll_inbox(&mut self) -> Result<usize> {
        let inbox = self.relay.read_inbox(&self.session_id, &self.self_id).await?;
        Ok(self.handle_inbox(&inbox).await)
    }

    pub async fn handle_signal(&mut self, signal: &Signal) -> Result<Outcome<()>> {
        if let Err(reason) = check_fresh(signal, now_millis(), self.stale_after) {
            return Ok(Outcome::Dropped(reason));
        }
        let peer_id = signal.from_id.as_str();
        let request_id = self.peers.request_id(peer_id);
        if !signal.belongs_to(request_id) {
            return Ok(Outcome::Dropped(DropReason::Superseded));
        }

        match &signal.message {
            SignalMessage::Offer(offer) => {
                let answer = match self.peers.create_answer(peer_id, offer.clone()).await {
                    Ok(Outcome::Applied(answer)) => answer,
                    Ok(Outcome::Dropped(reason)) => return Ok(Outcome::Dropped(reason)),
                    Err(e) => {
                        if let Some(closed) = self.peers.close(peer_id).await {
                            self.link_lost(closed);
                        }
                        return Err(e.into());
                    }
                };
                let reply =
                    Signal::new(self.self_id.as_str(), peer_id, SignalMessage::Answer(answer)).with_request(request_id);
                self.relay.send_signal(&self.session_id, &reply).await?;
                log::info!("Answered offer from {}", peer_id);
                Ok(Outcome::Applied(()))
            }
            SignalMessage::Candidate(candidate) => Ok(self.peers.add_ice_candidate(peer_id, candidate.clone()).await),
            SignalMessage::ViewRequest | SignalMessage::Answer(_) => Ok(Outcome::Dropped(DropReason::OrphanSignal)),
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(update) = self.peers.handle_event(event).await else {
            return;
        };
        match update {
            LinkUpdate::LocalCandidate { peer_id, candidate } => {
                let signal = Signal::new(self.self_id.as_str(), peer_id.as_str(), SignalMessage::Candidate(candidate))
                    .with_request(self.peers.request_id(&peer_id));
                let sent = self.relay.send_signal(&self.session_id, &signal).await;
                if let Err(e) = sent {
                    log::warn!("Failed to send candidate to {}: {}", peer_id, e);
                }
            }
            LinkUpdate::Connected { peer_id } => self.emitter.emit_connected(&peer_id),
            LinkUpdate::RemoteStream { peer_id, stream } => {
                log::info!("Receiving {} from {}", stream.stream_id, peer_id);
                let packets = stream.subscribe();
                tokio::spawn(forward_frames(peer_id.clone(), stream.clone(), packets, self.emitter.clone()));
                self.emitter.emit(AppEvent::RemoteStream {
                    peer_id,
                    stream_id: stream.stream_id,
                });
            }
            LinkUpdate::Problem { peer_id } => self.emitter.emit_connection_problem(&peer_id),
            LinkUpdate::Closed(closed) => self.link_lost(closed),
        }
    }

    /// Обрабатывает уже пришедшие события соединений (без актора)
    pub async fn drain_link_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.peers.try_next_event() {
            self.handle_link_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Закрывает все соединения и чистит свой ящик
    pub async fn shutdown(&mut self) {
        for closed in self.peers.close_all().await {
            self.report_closed(&closed);
        }
        self.single = None;
        self.grid.clear();
        self.switch_mode(ViewMode::Layout);
        if let Err(e) = self.relay.clear(&self.session_id, &self.self_id).await {
            log::warn!("Failed to clear inbox of {}: {}", self.self_id, e);
        }
        self.seen.clear();
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ViewSingle(peer_id, reply) => {
                let _ = reply.send(self.view_single(&peer_id).await);
            }
            Command::CloseSingle(reply) => {
                self.close_single().await;
                let _ = reply.send(());
            }
            Command::SetMode(mode, reply) => {
                let _ = reply.send(self.set_mode(mode).await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

enum Command {
    ViewSingle(String, oneshot::Sender<Result<()>>),
    CloseSingle(oneshot::Sender<()>),
    SetMode(ViewMode, oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<ViewerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Ручка актора преподавателя
#[derive(Clone)]
pub struct ViewerHandle {
    tx: mpsc::Sender<Command>,
}

impl ViewerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| Error::MachineStopped)?;
        rx.await.map_err(|_| Error::MachineStopped)
    }

    pub async fn view_single(&self, peer_id: impl Into<String>) -> Result<()> {
        let peer_id = peer_id.into();
        self.call(|reply| Command::ViewSingle(peer_id, reply)).await?
    }

    pub async fn close_single(&self) -> Result<()> {
        self.call(Command::CloseSingle).await
    }

    pub async fn set_mode(&self, mode: ViewMode) -> Result<()> {
        self.call(|reply| Command::SetMode(mode, reply)).await?
    }

    pub async fn snapshot(&self) -> Result<ViewerSnapshot> {
        self.call(Command::Snapshot).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Запускает актор: команды, ящик, снимки сессии и события соединений
/// обрабатываются по одному в одной задаче.
pub fn spawn(machine: ViewerMachine, presence: &Presence) -> ViewerHandle {
    let (tx, rx) = mpsc::channel(32);
    let inbox = machine.relay.subscribe(&machine.session_id, &machine.self_id);
    let session = presence.subscribe(&machine.session_id);
    tokio::spawn(run(machine, rx, inbox, session));
    ViewerHandle { tx }
}

async fn run(
    mut machine: ViewerMachine,
    mut commands: mpsc::Receiver<Command>,
    mut inbox: InboxSubscription,
    mut session: SessionSubscription,
) {
    let Some(mut link_events) = machine.peers.take_events() else {
        log::error!("Viewer link events already taken");
        return;
    };
    log::info!("Viewer {} watching session {}", machine.self_id, machine.session_id);

    let mut stopped = false;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !machine.handle_command(command).await {
                    stopped = true;
                    break;
                }
            }
            Some(snapshot) = inbox.next() => {
                machine.handle_inbox(&snapshot).await;
            }
            Some(snapshot) = session.next() => {
                machine.on_presence(snapshot).await;
                if machine.is_ended() {
                    stopped = true;
                    break;
                }
            }
            Some(event) = link_events.recv() => {
                machine.handle_link_event(event).await;
            }
        }
    }

    if !stopped {
        machine.shutdown().await;
    }
    log::info!("Viewer {} stopped", machine.self_id);
}

/// Пересылает пакеты принятого экрана в UI, пока поток не отвязан
async fn forward_frames(
    peer_id: String,
    stream: RemoteStream,
    mut packets: broadcast::Receiver<RemotePacket>,
    emitter: Emitter,
) {
    let detached = stream.detached();
    tokio::pin!(detached);
    loop {
        tokio::select! {
            _ = &mut detached => break,
            packet = packets.recv() => match packet {
                Ok(packet) => emitter.emit_frame(MediaFrame {
                    peer_id: peer_id.clone(),
                    stream_id: stream.stream_id.clone(),
                    sequence: packet.sequence,
                    timestamp: packet.timestamp,
                    marker: packet.marker,
                    payload: packet.payload.to_vec(),
                }),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Frames from {} lagged by {}", peer_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("Stopped forwarding frames from {}", peer_id);
}
