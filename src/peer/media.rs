use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Сколько пакетов ждёт медленного подписчика
const PACKET_BACKLOG: usize = 256;

/// Локально захваченный поток (экран студента).
///
/// Клоны делят одни и те же треки и один флаг завершения: все исходящие
/// соединения ссылаются на один захват и не могут его изменить.
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    ended: Arc<watch::Sender<bool>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: id.into(),
            tracks,
            ended: Arc::new(ended),
        }
    }

    /// Поток с одним VP8 видеотреком
    pub fn vp8_screen(id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "screen".to_owned(),
            id.clone(),
        ));
        Self::new(id, vec![track])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.tracks.first()
    }

    /// Останавливает захват; повторный вызов ничего не делает
    pub fn stop(&self) {
        self.ended.send_if_modified(|ended| !std::mem::replace(ended, true));
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Подписка на завершение захвата (кнопка платформы "прекратить показ")
    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Один и тот же захват?
    pub fn same_capture(&self, other: &LocalStream) -> bool {
        Arc::ptr_eq(&self.ended, &other.ended)
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Один RTP-пакет принятого видеотрека (полезная нагрузка VP8)
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePacket {
    pub sequence: u16,
    pub timestamp: u32,
    /// последний пакет кадра
    pub marker: bool,
    pub payload: Bytes,
}

/// Поток, пришедший от собеседника (первый сгруппированный поток).
///
/// Чтение треков идёт, пока поток не отвязан (`detach`); после этого
/// пакеты больше никому не доставляются.
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<Arc<TrackRemote>>,
    packets: broadcast::Sender<RemotePacket>,
    detached: Arc<watch::Sender<bool>>,
}

impl RemoteStream {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self::with_tracks(stream_id, Vec::new())
    }

    pub fn with_tracks(stream_id: impl Into<String>, tracks: Vec<Arc<TrackRemote>>) -> Self {
        let (packets, _) = broadcast::channel(PACKET_BACKLOG);
        let (detached, _) = watch::channel(false);
        Self {
            stream_id: stream_id.into(),
            tracks,
            packets,
            detached: Arc::new(detached),
        }
    }

    /// Пакеты, пришедшие после подписки
    pub fn subscribe(&self) -> broadcast::Receiver<RemotePacket> {
        self.packets.subscribe()
    }

    /// `false`, если поток уже отвязан и чтение надо прекратить
    pub fn push(&self, packet: RemotePacket) -> bool {
        if self.is_detached() {
            return false;
        }
        // подписчиков может не быть
        let _ = self.packets.send(packet);
        true
    }

    /// Отвязка от рендера: чтение и пересылка останавливаются
    pub fn detach(&self) {
        self.detached.send_replace(true);
    }

    pub fn is_detached(&self) -> bool {
        *self.detached.borrow()
    }

    /// Завершается, когда поток отвязан
    pub fn detached(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.detached.subscribe();
        async move {
            // ошибка = все клоны потока уничтожены
            let _ = rx.wait_for(|detached| *detached).await;
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_is_idempotent_and_shared_by_clones() {
        let stream = LocalStream::vp8_screen("screen-1");
        let clone = stream.clone();
        let mut signal = stream.ended_signal();

        clone.stop();
        clone.stop();

        assert!(stream.is_ended());
        assert!(signal.has_changed().unwrap());
        assert!(*signal.borrow_and_update());
        assert!(!signal.has_changed().unwrap());
        assert!(stream.same_capture(&clone));
    }

    #[test]
    fn distinct_captures_are_not_the_same() {
        let a = LocalStream::vp8_screen("a");
        let b = LocalStream::vp8_screen("b");
        assert!(!a.same_capture(&b));
        assert_eq!(a.tracks().len(), 1);
    }

    #[tokio::test]
    async fn detached_stream_stops_delivering() {
        let stream = RemoteStream::new("screen-1");
        let mut rx = stream.subscribe();
        let packet = RemotePacket {
            sequence: 1,
            timestamp: 3000,
            marker: true,
            payload: Bytes::from_static(b"vp8"),
        };

        assert!(stream.push(packet.clone()));
        assert_eq!(rx.recv().await.unwrap(), packet);

        let done = stream.detached();
        stream.clone().detach();
        done.await;
        assert!(stream.is_detached());
        assert!(!stream.push(packet));
        assert!(rx.try_recv().is_err());
    }
}
