use serde::{Serialize, Serializer};

/// Результат операций крейта
pub type Result<T> = std::result::Result<T, Error>;

/// Ошибки документного хранилища
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed document at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Не удалось записать, подтвердить или очистить сигнал
#[derive(Debug, thiserror::Error)]
#[error("relay error: {0}")]
pub struct RelayError(#[from] pub StoreError);

/// Ошибки захвата экрана
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("display capture denied: {0}")]
    Denied(String),

    #[error("display capture unavailable: {0}")]
    Unavailable(String),
}

/// Ошибки медиа-транспорта (webrtc)
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        TransportError::WebRtc(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("capture denied: {0}")]
    CaptureDenied(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state machine is not running")]
    MachineStopped,
}

impl From<CaptureError> for Error {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::Denied(msg) | CaptureError::Unavailable(msg) => Error::CaptureDenied(msg),
        }
    }
}

impl Error {
    /// Ошибки, которые требуют решения пользователя (разрешение, повтор)
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::Relay(_) | Error::CaptureDenied(_))
    }
}

// Для tauri-команд ошибка уходит во фронтенд строкой
impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Причины молчаливого отбрасывания сигнала или шага согласования
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// offer/answer пришёл не в том состоянии согласования
    NegotiationConflict,
    /// сигнал от пира, с которым нет соединения
    OrphanSignal,
    /// сигнал старше порога
    StaleSignal,
    /// view_request, когда экран не транслируется
    NotSharing,
    /// сигнал прежнего запроса того же зрителя
    Superseded,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::NegotiationConflict => "negotiation conflict",
            DropReason::OrphanSignal => "orphan signal",
            DropReason::StaleSignal => "stale signal",
            DropReason::NotSharing => "not sharing",
            DropReason::Superseded => "superseded link",
        };
        f.write_str(s)
    }
}

/// Итог шага, который может быть молча отброшен
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Applied(T),
    Dropped(DropReason),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn dropped(&self) -> Option<DropReason> {
        match self {
            Outcome::Dropped(reason) => Some(*reason),
            Outcome::Applied(_) => None,
        }
    }
}
