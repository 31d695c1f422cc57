//! Общие заготовки интеграционных тестов: сеть фейковых транспортов и лаборатория.
//!
//! `FakeTransport` умеет ровно то, что нужно машинам состояний: состояния
//! SDP, один trickle-кандидат на описание, соединение при применении ответа
//! и уведомление собеседника о закрытии. Ответ принимается только на своё
//! последнее предложение.

#![allow(dead_code)]

use async_trait::async_trait;
use labpulse_lib::capture::SampleCapture;
use labpulse_lib::config::Settings;
use labpulse_lib::errors::TransportError;
use labpulse_lib::logger::{AppEvent, Emitter, MediaFrame};
use labpulse_lib::peer::{
    IceCandidate, LocalStream, MediaTransport, RemoteStream, Role, SessionDescription, SignalingState,
    TransportEvent, TransportEventSink, TransportFactory, TransportState,
};
use labpulse_lib::session::{Presence, SessionDraft, StudentInfo};
use labpulse_lib::sharer::SharerMachine;
use labpulse_lib::signaling::SignalRelay;
use labpulse_lib::store::MemoryStore;
use labpulse_lib::viewer::ViewerMachine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;

#[derive(Default)]
pub struct FakeNetwork {
    transports: Mutex<HashMap<(String, String), Arc<FakeTransport>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>, owner: &str) -> Arc<FakeFactory> {
        Arc::new(FakeFactory {
            network: Arc::clone(self),
            owner: owner.to_owned(),
            created: AtomicUsize::new(0),
        })
    }

    /// Последний транспорт `owner` к `peer`
    pub fn transport(&self, owner: &str, peer: &str) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .unwrap()
            .get(&(owner.to_owned(), peer.to_owned()))
            .cloned()
    }

    fn register(&self, transport: &Arc<FakeTransport>) {
        self.transports.lock().unwrap().insert(
            (transport.owner.clone(), transport.peer.clone()),
            Arc::clone(transport),
        );
    }
}

pub struct FakeFactory {
    network: Arc<FakeNetwork>,
    owner: String,
    created: AtomicUsize,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        peer_id: &str,
        role: Role,
        events: TransportEventSink,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport {
            owner: self.owner.clone(),
            peer: peer_id.to_owned(),
            role,
            sink: events,
            network: Arc::downgrade(&self.network),
            state: Mutex::new(FakeState::default()),
        });
        self.network.register(&transport);
        Ok(transport)
    }
}

struct FakeState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stream_id: Option<String>,
    candidates: Vec<IceCandidate>,
    closed: bool,
    paired: Option<Weak<FakeTransport>>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            stream_id: None,
            candidates: Vec::new(),
            closed: false,
            paired: None,
        }
    }
}

pub struct FakeTransport {
    owner: String,
    peer: String,
    role: Role,
    sink: TransportEventSink,
    network: Weak<FakeNetwork>,
    state: Mutex<FakeState>,
}

pub fn host_candidate(owner: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.7 50000 typ host", owner),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}

fn sdp_field(sdp: &str, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);
    sdp.split_whitespace()
        .find_map(|part| part.strip_prefix(prefix.as_str()))
        .map(str::to_owned)
}

impl FakeTransport {
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    fn offer_token(&self) -> String {
        format!("{}#{}", self.owner, self.generation())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn received_candidates(&self) -> usize {
        self.state.lock().unwrap().candidates.len()
    }

    /// Как будто ICE-агент сменил состояние
    pub fn report(&self, state: TransportState) {
        self.sink.emit(TransportEvent::StateChanged(state));
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn has_remote(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    /// Соединяется с принимающей стороной после применения ответа
    fn pair(self: &Arc<Self>) {
        let Some(network) = self.network.upgrade() else { return };
        let Some(other) = network.transport(&self.peer, &self.owner) else { return };
        if other.is_closed() || !other.has_remote() {
            return;
        }
        let stream_id = self.state.lock().unwrap().stream_id.clone();
        self.state.lock().unwrap().paired = Some(Arc::downgrade(&other));
        other.state.lock().unwrap().paired = Some(Arc::downgrade(self));

        self.report(TransportState::Connected);
        other.report(TransportState::Connected);
        if other.role == Role::Receiver {
            let id = stream_id.unwrap_or_else(|| "screen".into());
            other.sink.emit(TransportEvent::RemoteStream(RemoteStream::new(id)));
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn add_local_stream(&self, stream: &LocalStream) -> Result<(), TransportError> {
        self.check_open()?;
        self.state.lock().unwrap().stream_id = Some(stream.id().to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let offer = {
            let mut state = self.state.lock().unwrap();
            if state.signaling != SignalingState::Stable {
                return Err(TransportError::InvalidDescription("offer outside stable".into()));
            }
            let stream = state.stream_id.clone().unwrap_or_else(|| "none".into());
            let offer = SessionDescription::offer(format!(
                "v=0 fake {} -> {} stream={} offer={}",
                self.owner,
                self.peer,
                stream,
                self.offer_token()
            ));
            state.signaling = SignalingState::HaveLocalOffer;
            state.local = Some(offer.clone());
            offer
        };
        self.sink.emit(TransportEvent::LocalCandidate(host_candidate(&self.owner)));
        Ok(offer)
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        self.check_open()?;
        let answer = {
            let mut state = self.state.lock().unwrap();
            if state.signaling != SignalingState::Stable {
                return Err(TransportError::InvalidDescription("offer outside stable".into()));
            }
            state.stream_id = sdp_field(&offer.sdp, "stream");
            let token = sdp_field(&offer.sdp, "offer").unwrap_or_else(|| "none".into());
            state.remote = Some(offer);
            let answer = SessionDescription::answer(format!(
                "v=0 fake answer {} -> {} re={}",
                self.owner, self.peer, token
            ));
            state.local = Some(answer.clone());
            answer
        };
        self.sink.emit(TransportEvent::LocalCandidate(host_candidate(&self.owner)));
        Ok(answer)
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), TransportError> {
        self.check_open()?;
        {
            let mut state = self.state.lock().unwrap();
            if state.signaling != SignalingState::HaveLocalOffer {
                return Err(TransportError::InvalidDescription("answer without offer".into()));
            }
            // ответ на чужое предложение
            if let Some(token) = sdp_field(&answer.sdp, "re") {
                if token != self.offer_token() {
                    return Err(TransportError::InvalidDescription(format!(
                        "answer for offer {} applied to {}",
                        token,
                        self.offer_token()
                    )));
                }
            }
            state.signaling = SignalingState::Stable;
            state.remote = Some(answer);
        }
        if let Some(me) = self.network.upgrade().and_then(|n| n.transport(&self.owner, &self.peer)) {
            if std::ptr::eq(Arc::as_ptr(&me), self) {
                me.pair();
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(TransportError::InvalidDescription("candidate before remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.has_remote()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let paired = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            state.paired.take()
        };
        self.report(TransportState::Closed);
        if let Some(other) = paired.and_then(|w| w.upgrade()) {
            if !other.is_closed() {
                other.report(TransportState::Closed);
            }
        }
        Ok(())
    }
}

pub struct Lab {
    pub store: Arc<MemoryStore>,
    pub relay: SignalRelay,
    pub presence: Presence,
    pub network: Arc<FakeNetwork>,
    pub settings: Settings,
    pub session_id: String,
}

pub struct Student {
    pub machine: SharerMachine,
    pub capture: Arc<SampleCapture>,
    pub events: broadcast::Receiver<AppEvent>,
}

pub struct Faculty {
    pub machine: ViewerMachine,
    pub events: broadcast::Receiver<AppEvent>,
    pub frames: broadcast::Receiver<MediaFrame>,
}

impl Lab {
    pub async fn new() -> Self {
        Self::with_settings(Settings::default()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let presence = Presence::new(store.clone());
        let session_id = presence
            .create_session(&SessionDraft {
                title: "Linked lists".into(),
                subject: "Data Structures".into(),
                lab_id: "lab-2".into(),
                faculty_id: "fac-a".into(),
                faculty_name: "A. Joshi".into(),
                year: "SE".into(),
                division: "A".into(),
                semester: "3".into(),
                assignment_count: 1,
                reference_file_url: None,
            })
            .await
            .expect("session created");
        Self {
            relay: SignalRelay::new(store.clone()),
            store,
            presence,
            network: FakeNetwork::new(),
            settings,
            session_id,
        }
    }

    pub fn faculty(&self, faculty_id: &str) -> Faculty {
        let emitter = Emitter::new(256);
        let events = emitter.subscribe();
        let frames = emitter.subscribe_frames();
        let machine = ViewerMachine::new(
            self.session_id.clone(),
            faculty_id,
            self.relay.clone(),
            self.network.factory(faculty_id),
            emitter,
            &self.settings,
        );
        Faculty {
            machine,
            events,
            frames,
        }
    }

    /// Студент на месте `seat`, пока без трансляции
    pub async fn student(&self, sap_id: &str, seat: &str) -> Student {
        self.presence
            .occupy_seat(
                &self.session_id,
                seat,
                &StudentInfo {
                    sap_id: sap_id.into(),
                    name: format!("Student {}", sap_id),
                },
            )
            .await
            .expect("seat occupied");
        let emitter = Emitter::new(256);
        let events = emitter.subscribe();
        let capture = Arc::new(SampleCapture::new());
        let machine = SharerMachine::new(
            self.session_id.clone(),
            sap_id,
            seat,
            self.relay.clone(),
            self.presence.clone(),
            capture.clone(),
            self.network.factory(sap_id),
            emitter,
            &self.settings,
        );
        Student {
            machine,
            capture,
            events,
        }
    }

    /// Отдаёт зрителю текущий документ сессии
    pub async fn refresh(&self, viewer: &mut ViewerMachine) {
        let session = self.presence.get_session(&self.session_id).await.expect("session read");
        viewer.on_presence(session).await;
    }

    pub async fn seat_is_sharing(&self, seat: &str) -> bool {
        let session = self
            .presence
            .get_session(&self.session_id)
            .await
            .expect("session read")
            .expect("session exists");
        session.seats.get(seat).is_some_and(|s| s.is_sharing)
    }
}

/// Гоняет ящики и события соединений всех машин, пока всё не затихнет
pub async fn pump(viewers: &mut [&mut ViewerMachine], sharers: &mut [&mut SharerMachine]) {
    for _ in 0..32 {
        let mut moved = 0;
        for viewer in viewers.iter_mut() {
            moved += viewer.poll_inbox().await.expect("viewer inbox");
            moved += viewer.drain_link_events().await;
        }
        for sharer in sharers.iter_mut() {
            moved += sharer.poll_inbox().await.expect("sharer inbox");
            moved += sharer.drain_link_events().await;
        }
        if moved == 0 {
            return;
        }
    }
    panic!("machines did not settle");
}

pub fn drain(rx: &mut broadcast::Receiver<AppEvent>) -> Vec<AppEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
