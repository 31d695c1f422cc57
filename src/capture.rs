//! Граница захвата экрана.

use crate::errors::CaptureError;
use crate::peer::media::LocalStream;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use webrtc::media::Sample;

#[async_trait]
pub trait DisplayCapture: Send + Sync {
    /// Запрос захвата экрана; может ждать решения пользователя
    async fn request_display_capture(&self) -> Result<LocalStream, CaptureError>;
}

/// Захват, в который хост сам пишет закодированные VP8 кадры
/// (нативный граббер экрана или webview через tauri-команду).
pub struct SampleCapture {
    permitted: AtomicBool,
    current: Mutex<Option<LocalStream>>,
}

impl Default for SampleCapture {
    fn default() -> Self {
        Self {
            permitted: AtomicBool::new(true),
            current: Mutex::new(None),
        }
    }
}

impl SampleCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Разрешение пользователя на захват
    pub fn set_permitted(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    /// Текущий незавершённый захват
    pub fn current(&self) -> Option<LocalStream> {
        self.lock().as_ref().filter(|s| !s.is_ended()).cloned()
    }

    /// Платформа завершила захват
    pub fn end(&self) {
        if let Some(stream) = self.lock().take() {
            log::info!("Display capture {} ended by platform", stream.id());
            stream.stop();
        }
    }

    /// Пишет один закодированный кадр в видеотрек текущего захвата
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<(), CaptureError> {
        let track = self
            .current()
            .and_then(|s| s.video_track().cloned())
            .ok_or_else(|| CaptureError::Unavailable("no active capture".into()))?;
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        track
            .write_sample(&sample)
            .await
            .map_err(|e| CaptureError::Unavailable(e.to_string()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LocalStream>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DisplayCapture for SampleCapture {
    async fn request_display_capture(&self) -> Result<LocalStream, CaptureError> {
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(CaptureError::Denied("permission refused".into()));
        }
        if let Some(stream) = self.current() {
            return Ok(stream);
        }
        let stream = LocalStream::vp8_screen(format!("screen-{}", random_id()));
        *self.lock() = Some(stream.clone());
        Ok(stream)
    }
}
