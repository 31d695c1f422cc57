//! Машина состояний студента: отдаёт свой экран преподавателям.
//!
//! `inactive → capturing → serving(N)`. Все исходящие соединения
//! используют один захват; остановить его может только `stop_sharing`
//! или сама платформа.

use crate::capture::DisplayCapture;
use crate::config::Settings;
use crate::errors::{DropReason, Error, Outcome, Result};
use crate::logger::{AppEvent, Emitter};
use crate::peer::manager::{CloseReason, ClosedLink, LinkSummary, LinkUpdate, PeerManager};
use crate::peer::media::LocalStream;
use crate::peer::state::LinkState;
use crate::peer::transport::{LinkEvent, TransportFactory};
use crate::peer::types::Role;
use crate::session::Presence;
use crate::signaling::{
    check_fresh, Envelope, Inbox, InboxSubscription, SeenSignals, Signal, SignalMessage, SignalRelay,
};
use crate::utils::now_millis;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "viewers", rename_all = "lowercase")]
pub enum SharerState {
    Inactive,
    Capturing,
    Serving(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharerSnapshot {
    pub state: SharerState,
    pub seat: String,
    pub links: Vec<LinkSummary>,
}

pub struct SharerMachine {
    session_id: String,
    self_id: String,
    seat: String,
    relay: SignalRelay,
    presence: Presence,
    capture: Arc<dyn DisplayCapture>,
    peers: PeerManager,
    emitter: Emitter,
    stale_after: Option<Duration>,
    stream: Option<LocalStream>,
    seen: SeenSignals,
}

impl SharerMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        self_id: impl Into<String>,
        seat: impl Into<String>,
        relay: SignalRelay,
        presence: Presence,
        capture: Arc<dyn DisplayCapture>,
        factory: Arc<dyn TransportFactory>,
        emitter: Emitter,
        settings: &Settings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            self_id: self_id.into(),
            seat: seat.into(),
            relay,
            presence,
            capture,
            peers: PeerManager::new(factory, settings.negotiation_deadline()),
            emitter,
            stale_after: settings.sharer_stale_after(),
            stream: None,
            seen: SeenSignals::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn seat(&self) -> &str {
        &self.seat
    }

    pub fn is_sharing(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn link_count(&self) -> usize {
        self.peers.len()
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.peers.get(peer_id).map(|link| link.state())
    }

    pub fn state(&self) -> SharerState {
        match (&self.stream, self.peers.len()) {
            (None, _) => SharerState::Inactive,
            (Some(_), 0) => SharerState::Capturing,
            (Some(_), n) => SharerState::Serving(n),
        }
    }

    pub fn snapshot(&self) -> SharerSnapshot {
        SharerSnapshot {
            state: self.state(),
            seat: self.seat.clone(),
            links: self.peers.summaries(),
        }
    }

    /// После смены места флаг трансляции публикуется на новом месте
    pub fn set_seat(&mut self, seat: impl Into<String>) {
        self.seat = seat.into();
    }

    /// Подписка на завершение текущего захвата
    pub fn capture_ended(&self) -> Option<watch::Receiver<bool>> {
        self.stream.as_ref().map(LocalStream::ended_signal)
    }

    /// Запрашивает захват экрана и публикует `isSharing=true`
    pub async fn start_sharing(&mut self) -> Result<()> {
        if self.stream.as_ref().is_some_and(|s| !s.is_ended()) {
            return Ok(());
        }
        // захват мог закончиться раньше, чем цикл это заметил
        self.on_capture_ended().await;

        let stream = match self.capture.request_display_capture().await {
            Ok(stream) => stream,
            Err(e) => {
                let err = Error::from(e);
                self.emitter.emit_error(err.to_string());
                return Err(err);
            }
        };

        if let Err(e) = self.presence.set_sharing(&self.session_id, &self.seat, true).await {
            stream.stop();
            return Err(e);
        }

        log::info!("Sharing screen {} from seat {}", stream.id(), self.seat);
        self.stream = Some(stream);
        self.emitter.emit(AppEvent::SharingStarted);
        Ok(())
    }

    /// Закрывает все исходящие соединения, останавливает захват,
    /// публикует `isSharing=false`. Повторный вызов ничего не делает.
    pub async fn stop_sharing(&mut self) -> Result<()> {
        for closed in self.peers.close_all().await {
            self.report_closed(&closed);
        }
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        stream.stop();
        log::info!("Stopped sharing {}", stream.id());
        self.emitter.emit(AppEvent::SharingStopped);
        self.presence.set_sharing(&self.session_id, &self.seat, false).await
    }

    /// Платформа завершила захват ("прекратить показ")
    pub async fn on_capture_ended(&mut self) {
        if !self.stream.as_ref().is_some_and(LocalStream::is_ended) {
            return;
        }
        log::info!("Capture ended by platform");
        if let Err(e) = self.stop_sharing().await {
            self.emitter.emit_error(format!("Failed to publish end of sharing: {}", e));
        }
    }

    fn report_closed(&self, closed: &ClosedLink) {
        if closed.reason == CloseReason::TimedOut {
            self.emitter.emit(AppEvent::ConnectionTimedOut {
                peer_id: closed.peer_id.clone(),
            });
        }
        self.emitter.emit(AppEvent::LinkClosed {
            peer_id: closed.peer_id.clone(),
        });
    }

    pub async fn handle_inbox(&mut self, inbox: &Inbox) -> usize {
        let fresh = self.seen.unseen(inbox);
        let count = fresh.len();
        let latest = latest_requests(&fresh);
        for envelope in &fresh {
            let signal = &envelope.signal;
            let handled = if is_superseded_request(envelope, &latest) {
                Ok(Outcome::Dropped(DropReason::Superseded))
            } else {
                self.handle_signal(signal).await
            };
            match handled {
                Ok(Outcome::Applied(())) => {}
                Ok(Outcome::Dropped(reason)) => {
                    log::debug!("Dropped {} from {}: {}", signal.kind(), signal.from_id, reason)
                }
                Err(e) => self
                    .emitter
                    .emit_error(format!("Failed to handle {} from {}: {}", signal.kind(), signal.from_id, e)),
            }
            if let Err(e) = self.relay.ack(&self.session_id, &self.self_id, envelope).await {
                log::warn!("Failed to ack signal {}: {}", envelope.key, e);
            }
        }
        count
    }

    pub async fn poll_inbox(&mut self) -> Result<usize> {
        let inbox = self.relay.read_inbox(&self.session_id, &self.self_id).await?;
        Ok(self.handle_inbox(&inbox).await)
    }

    pub async fn handle_signal(&mut self, signal: &Signal) -> Result<Outcome<()>> {
        if let Some(limit) = self.stale_after {
            if let Err(reason) = check_fresh(signal, now_millis(), limit) {
                return Ok(Outcome::Dropped(reason));
            }
        }
        let peer_id = signal.from_id.as_str();

        if !matches!(signal.message, SignalMessage::ViewRequest)
            && !signal.belongs_to(self.peers.request_id(peer_id))
        {
            return Ok(Outcome::Dropped(DropReason::Superseded));
        }

        match &signal.message {
            SignalMessage::ViewRequest => self.serve(peer_id, signal.request_id).await,
            SignalMessage::Answer(answer) => Ok(self.peers.apply_answer(peer_id, answer.clone()).await?),
            SignalMessage::Candidate(candidate) => Ok(self.peers.add_ice_candidate(peer_id, candidate.clone()).await),
            SignalMessage::Offer(_) => Ok(Outcome::Dropped(DropReason::OrphanSignal)),
        }
    }

    /// Новое исходящее соединение к преподавателю
    async fn serve(&mut self, viewer_id: &str, request_id: Option<u64>) -> Result<Outcome<()>> {
        let Some(stream) = self.stream.clone().filter(|s| !s.is_ended()) else {
            return Ok(Outcome::Dropped(DropReason::NotSharing));
        };
        self.emitter.emit(AppEvent::ViewRequested {
            peer_id: viewer_id.to_owned(),
        });

        match self.offer_to(viewer_id, request_id, &stream).await {
            Ok(()) => {
                log::info!("Offered screen to {} ({} viewers)", viewer_id, self.peers.len());
                Ok(Outcome::Applied(()))
            }
            Err(e) => {
                if let Some(closed) = self.peers.close(viewer_id).await {
                    self.report_closed(&closed);
                }
                Err(e)
            }
        }
    }

    async fn offer_to(&mut self, viewer_id: &str, request_id: Option<u64>, stream: &LocalStream) -> Result<()> {
        self.peers.create(viewer_id, Role::Sender).await?;
        self.peers.set_request_id(viewer_id, request_id);
        self.peers.attach_local_stream(viewer_id, stream).await?;
        let offer = match self.peers.create_offer(viewer_id).await? {
            Outcome::Applied(offer) => offer,
            Outcome::Dropped(reason) => {
                return Err(Error::InvalidRequest(format!("offer not created: {}", reason)))
            }
        };
        let signal =
            Signal::new(self.self_id.as_str(), viewer_id, SignalMessage::Offer(offer)).with_request(request_id);
        self.relay.send_signal(&self.session_id, &signal).await?;
        Ok(())
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
            LinkUpdate::RemoteStream { peer_id, .. } => {
                log::debug!("Ignoring remote stream on outbound link to {}", peer_id)
            }
            LinkUpdate::Problem { peer_id } => self.emitter.emit_connection_problem(&peer_id),
            LinkUpdate::Closed(closed) => {
                log::info!("Viewer {} left ({:?})", closed.peer_id, closed.reason);
                self.report_closed(&closed);
            }
        }
    }

    pub async fn drain_link_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.peers.try_next_event() {
            self.handle_link_event(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stop_sharing().await {
            log::warn!("Failed to publish end of sharing: {}", e);
        }
        if let Err(e) = self.relay.clear(&self.session_id, &self.self_id).await {
            log::warn!("Failed to clear inbox of {}: {}", self.self_id, e);
        }
        self.seen.clear();
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start_sharing().await);
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop_sharing().await);
            }
            Command::SetSeat(seat, reply) => {
                self.set_seat(seat);
                let _ = reply.send(());
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

/// Ключ последнего view_request каждого отправителя в пачке
fn latest_requests(fresh: &[Envelope]) -> HashMap<&str, &str> {
    fresh
        .iter()
        .filter(|env| matches!(env.signal.message, SignalMessage::ViewRequest))
        .map(|env| (env.sender(), env.key.as_str()))
        .collect()
}

/// Более ранний view_request того же зрителя уже не нужен
fn is_superseded_request(envelope: &Envelope, latest: &HashMap<&str, &str>) -> bool {
    matches!(envelope.signal.message, SignalMessage::ViewRequest)
        && latest
            .get(envelope.sender())
            .is_some_and(|key| *key != envelope.key)
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    SetSeat(String, oneshot::Sender<()>),
    Snapshot(oneshot::Sender<SharerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Ручка актора студента
#[derive(Clone)]
pub struct SharerHandle {
    tx: mpsc::Sender<Command>,
}

impl SharerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| Error::MachineStopped)?;
        rx.await.map_err(|_| Error::MachineStopped)
    }

    pub async fn start_sharing(&self) -> Result<()> {
        self.call(Command::Start).await?
    }

    pub async fn stop_sharing(&self) -> Result<()> {
        self.call(Command::Stop).await?
    }

    pub async fn set_seat(&self, seat: impl Into<String>) -> Result<()> {
        let seat = seat.into();
        self.call(|reply| Command::SetSeat(seat, reply)).await
    }

    pub async fn snapshot(&self) -> Result<SharerSnapshot> {
        self.call(Command::Snapshot).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub fn spawn(machine: SharerMachine) -> SharerHandle {
    let (tx, rx) = mpsc::channel(32);
    let inbox = machine.relay.subscribe(&machine.session_id, &machine.self_id);
    tokio::spawn(run(machine, rx, inbox));
    SharerHandle { tx }
}

async fn wait_ended(signal: &mut Option<watch::Receiver<bool>>) {
    match signal {
        // ошибка = захват уничтожен, это тоже конец
        Some(rx) => {
            let _ = rx.wait_for(|ended| *ended).await;
        }
        None => std::future::pending().await,
    }
}

async fn run(mut machine: SharerMachine, mut commands: mpsc::Receiver<Command>, mut inbox: InboxSubscription) {
    let Some(mut link_events) = machine.peers.take_events() else {
        log::error!("Sharer link events already taken");
        return;
    };
    log::info!("Sharer {} ready in session {}", machine.self_id, machine.session_id);

    let mut ended = machine.capture_ended();
    let mut stopped = false;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if !machine.handle_command(command).await {
                    stopped = true;
                    break;
                }
                ended = machine.capture_ended();
            }
            () = wait_ended(&mut ended) => {
                machine.on_capture_ended().await;
                ended = machine.capture_ended();
            }
            Some(snapshot) = inbox.next() => {
                machine.handle_inbox(&snapshot).await;
            }
            Some(event) = link_events.recv() => {
                machine.handle_link_event(event).await;
            }
        }
    }

    if !stopped {
        machine.shutdown().await;
    }
    log::info!("Sharer {} stopped", machine.self_id);
}
