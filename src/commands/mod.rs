pub mod faculty_api;
pub mod student_api;
pub mod util_api;

use crate::capture::SampleCapture;
use crate::config::Settings;
use crate::errors::{Error, Result};
use crate::logger::{AppEvent, Emitter, MediaFrame};
use crate::peer::{RtcTransportFactory, TransportFactory};
use crate::session::Presence;
use crate::sharer::SharerHandle;
use crate::signaling::SignalRelay;
use crate::store::{DocumentStore, MemoryStore};
use crate::viewer::ViewerHandle;
use std::sync::Arc;
use tauri::{AppHandle, Emitter as _, Runtime};
use tokio::sync::{broadcast, Mutex};

/// Имя события для фронтенда
pub const EVENT_NAME: &str = "labpulse-event";

/// Имя события с RTP-пакетами принятых экранов
pub const FRAME_EVENT: &str = "labpulse-frame";

/// Общее состояние плагина
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn DocumentStore>,
    pub presence: Presence,
    pub relay: SignalRelay,
    pub emitter: Emitter,
    pub capture: Arc<SampleCapture>,
    pub factory: Arc<dyn TransportFactory>,
    viewer: Mutex<Option<ViewerHandle>>,
    sharer: Mutex<Option<SharerHandle>>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        Self {
            presence: Presence::new(store.clone()),
            relay: SignalRelay::new(store.clone()),
            emitter: Emitter::new(settings.event_capacity),
            capture: Arc::new(SampleCapture::new()),
            factory: Arc::new(RtcTransportFactory::new(&settings.ice_servers)),
            store,
            settings,
            viewer: Mutex::new(None),
            sharer: Mutex::new(None),
        }
    }

    pub async fn viewer(&self) -> Result<ViewerHandle> {
        self.viewer
            .lock()
            .await
            .clone()
            .filter(ViewerHandle::is_running)
            .ok_or_else(|| Error::InvalidRequest("viewer is not open".into()))
    }

    /// Ставит новый актор, прежний останавливается
    pub async fn replace_viewer(&self, handle: Option<ViewerHandle>) {
        let previous = std::mem::replace(&mut *self.viewer.lock().await, handle);
        if let Some(previous) = previous {
            // уже остановленный актор - не ошибка
            let _ = previous.shutdown().await;
        }
    }

    pub async fn sharer(&self) -> Result<SharerHandle> {
        self.sharer
            .lock()
            .await
            .clone()
            .filter(SharerHandle::is_running)
            .ok_or_else(|| Error::InvalidRequest("not joined to a session".into()))
    }

    pub async fn replace_sharer(&self, handle: Option<SharerHandle>) {
        let previous = std::mem::replace(&mut *self.sharer.lock().await, handle);
        if let Some(previous) = previous {
            let _ = previous.shutdown().await;
        }
    }
}

/// Пересылает события машин во фронтенд
pub fn forward_events<R: Runtime>(app: AppHandle<R>, mut rx: broadcast::Receiver<AppEvent>) {
    tauri::async_runtime::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = app.emit(EVENT_NAME, &event) {
                        log::warn!("Failed to emit {:?}: {}", event, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("UI lagged behind, {} events skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Пересылает пакеты принятых экранов в webview
pub fn forward_frames<R: Runtime>(app: AppHandle<R>, mut rx: broadcast::Receiver<MediaFrame>) {
    tauri::async_runtime::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if let Err(e) = app.emit(FRAME_EVENT, &frame) {
                        log::debug!("Failed to emit frame from {}: {}", frame.peer_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("UI lagged behind, {} frames skipped", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
