use serde::Serialize;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

/// Инициализация логирования с учётом конфигурации
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }
    let env = env_logger::Env::default().default_filter_or("labpulse_lib=info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        log::debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
            init.candidate,
            init.sdp_mid,
            init.sdp_mline_index
        );
    }
}

/// События для UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AppEvent {
    SharingStarted,
    SharingStopped,
    #[serde(rename_all = "camelCase")]
    ViewRequested { peer_id: String },
    #[serde(rename_all = "camelCase")]
    Connected { peer_id: String },
    #[serde(rename_all = "camelCase")]
    RemoteStream { peer_id: String, stream_id: String },
    #[serde(rename_all = "camelCase")]
    StreamDetached { peer_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectionProblem { peer_id: String },
    #[serde(rename_all = "camelCase")]
    ConnectionTimedOut { peer_id: String },
    #[serde(rename_all = "camelCase")]
    LinkClosed { peer_id: String },
    /// плитка сетки потеряна; откроется заново при следующем обновлении присутствия
    #[serde(rename_all = "camelCase")]
    GridTileLost { peer_id: String },
    ModeChanged { mode: String },
    SessionEnded,
    Error { message: String },
}

/// RTP-пакет принятого экрана для рендера в webview
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFrame {
    pub peer_id: String,
    pub stream_id: String,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Vec<u8>,
}

const FRAME_BACKLOG: usize = 256;

/// Рассылка событий в UI (и в тесты)
#[derive(Clone)]
pub struct Emitter {
    tx: broadcast::Sender<AppEvent>,
    frames: broadcast::Sender<MediaFrame>,
}

impl Emitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        Self { tx, frames }
    }

    /// Медиа идёт отдельным каналом, чтобы не вытеснять события
    pub fn subscribe_frames(&self) -> broadcast::Receiver<MediaFrame> {
        self.frames.subscribe()
    }

    pub fn emit_frame(&self, frame: MediaFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        log::debug!("emit {:?}", event);
        // подписчиков может не быть
        let _ = self.tx.send(event);
    }

    pub fn emit_connected(&self, peer_id: &str) {
        self.emit(AppEvent::Connected {
            peer_id: peer_id.to_owned(),
        });
    }

    pub fn emit_detached(&self, peer_id: &str) {
        self.emit(AppEvent::StreamDetached {
            peer_id: peer_id.to_owned(),
        });
    }

    pub fn emit_connection_problem(&self, peer_id: &str) {
        log::warn!("Connection problem with {}", peer_id);
        self.emit(AppEvent::ConnectionProblem {
            peer_id: peer_id.to_owned(),
        });
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{}", message);
        self.emit(AppEvent::Error { message });
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(64)
    }
}
