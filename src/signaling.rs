//! Клиент сигнального реле.
//!
//! Реле - это почтовые ящики в документном хранилище:
//! `signals/{sessionId}/{toId}/{fromId}/{pushKey}`. Внутри пары
//! отправитель→получатель порядок сохраняется, между отправителями - нет.
//! Получатель подтверждает каждый сигнал отдельно сразу после обработки.

use crate::errors::{DropReason, RelayError, StoreError};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::store::{join_path, DocumentStore, Subscription};
use crate::utils::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const SIGNALS_ROOT: &str = "signals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ViewRequest,
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::ViewRequest => "view_request",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        };
        f.write_str(s)
    }
}

/// Содержимое сигнала
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    ViewRequest,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalMessage::ViewRequest => SignalKind::ViewRequest,
            SignalMessage::Offer(_) => SignalKind::Offer,
            SignalMessage::Answer(_) => SignalKind::Answer,
            SignalMessage::Candidate(_) => SignalKind::Candidate,
        }
    }
}

/// Направленное сообщение от одного участника другому
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct Signal {
    pub from_id: String,
    pub to_id: String,
    pub message: SignalMessage,
    /// unix ms
    pub timestamp: i64,
    /// поколение соединения зрителя, к которому относится сигнал
    pub request_id: Option<u64>,
}

impl Signal {
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, message: SignalMessage) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            message,
            timestamp: now_millis(),
            request_id: None,
        }
    }

    pub fn with_request(mut self, request_id: Option<u64>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Сигнал без метки или с меткой текущего соединения
    pub fn belongs_to(&self, request_id: Option<u64>) -> bool {
        match (self.request_id, request_id) {
            (Some(tag), Some(current)) => tag == current,
            _ => true,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.message.kind()
    }
}

// Формат документа в хранилище: {fromId, toId, type, payload, timestamp}
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSignal {
    from_id: String,
    to_id: String,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
}

impl TryFrom<WireSignal> for Signal {
    type Error = serde_json::Error;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        let payload = wire.payload.unwrap_or(Value::Null);
        let message = match wire.kind {
            SignalKind::ViewRequest => SignalMessage::ViewRequest,
            SignalKind::Offer => SignalMessage::Offer(serde_json::from_value(payload)?),
            SignalKind::Answer => SignalMessage::Answer(serde_json::from_value(payload)?),
            SignalKind::Candidate => SignalMessage::Candidate(serde_json::from_value(payload)?),
        };
        Ok(Signal {
            from_id: wire.from_id,
            to_id: wire.to_id,
            message,
            timestamp: wire.timestamp,
            request_id: wire.request_id,
        })
    }
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        let kind = signal.kind();
        let payload = match signal.message {
            SignalMessage::ViewRequest => None,
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => serde_json::to_value(desc).ok(),
            SignalMessage::Candidate(cand) => serde_json::to_value(cand).ok(),
        };
        WireSignal {
            from_id: signal.from_id,
            to_id: signal.to_id,
            kind,
            payload,
            timestamp: signal.timestamp,
            request_id: signal.request_id,
        }
    }
}

/// Сигнал вместе с ключом, под которым он лежит в ящике
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub key: String,
    pub signal: Signal,
}

impl Envelope {
    pub fn sender(&self) -> &str {
        &self.signal.from_id
    }

    fn seen_id(&self) -> String {
        format!("{}/{}", self.signal.from_id, self.key)
    }
}

/// Полный снимок ящика, сгруппированный по отправителю
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inbox {
    by_sender: BTreeMap<String, Vec<Envelope>>,
}

impl Inbox {
    /// Разбирает снимок ящика; битые записи пропускаются
    pub fn from_value(value: Option<Value>) -> Self {
        let mut by_sender = BTreeMap::new();
        let Some(Value::Object(senders)) = value else {
            return Self { by_sender };
        };

        for (sender, entries) in senders {
            let Value::Object(entries) = entries else {
                log::warn!("Skipping malformed inbox branch for sender {}", sender);
                continue;
            };
            let mut envelopes: Vec<Envelope> = entries
                .into_iter()
                .filter_map(|(key, raw)| match serde_json::from_value::<Signal>(raw) {
                    Ok(signal) if signal.from_id == sender => Some(Envelope { key, signal }),
                    Ok(signal) => {
                        log::warn!(
                            "Skipping signal {} filed under {} but sent by {}",
                            key,
                            sender,
                            signal.from_id
                        );
                        None
                    }
                    Err(e) => {
                        log::warn!("Skipping malformed signal {}/{}: {}", sender, key, e);
                        None
                    }
                })
                .collect();
            envelopes.sort_by(|a, b| a.key.cmp(&b.key));
            if !envelopes.is_empty() {
                by_sender.insert(sender, envelopes);
            }
        }
        Self { by_sender }
    }

    pub fn is_empty(&self) -> bool {
        self.by_sender.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_sender.values().map(Vec::len).sum()
    }

    pub fn senders(&self) -> impl Iterator<Item = &str> {
        self.by_sender.keys().map(String::as_str)
    }

    pub fn from_sender(&self, sender: &str) -> &[Envelope] {
        self.by_sender.get(sender).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Все сигналы: отправитель за отправителем, внутри - по порядку отправки
    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.by_sender.values().flatten()
    }
}

/// Уже обработанные сигналы, чьё удаление ещё может быть в пути
#[derive(Debug, Default)]
pub struct SeenSignals {
    ids: HashSet<String>,
}

impl SeenSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает ещё не обработанные сигналы снимка и помечает их.
    /// Ключи, которых в снимке уже нет, забываются.
    pub fn unseen(&mut self, inbox: &Inbox) -> Vec<Envelope> {
        let present: HashSet<String> = inbox.iter().map(Envelope::seen_id).collect();
        self.ids.retain(|id| present.contains(id));

        inbox
            .iter()
            .filter(|env| self.ids.insert(env.seen_id()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Сигнал старше порога отбрасывается
pub fn check_fresh(signal: &Signal, now_ms: i64, threshold: Duration) -> Result<(), DropReason> {
    let age = now_ms.saturating_sub(signal.timestamp);
    if age > threshold.as_millis() as i64 {
        return Err(DropReason::StaleSignal);
    }
    Ok(())
}

/// Живая подписка на свой ящик
pub struct InboxSubscription {
    inner: Subscription,
}

impl InboxSubscription {
    /// Следующий полный снимок ящика; `None`, если хранилище закрыто
    pub async fn next(&mut self) -> Option<Inbox> {
        self.inner.next().await.map(Inbox::from_value)
    }
}

#[derive(Clone)]
pub struct SignalRelay {
    store: Arc<dyn DocumentStore>,
}

impl SignalRelay {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn inbox_path(session_id: &str, self_id: &str) -> String {
        join_path(&[SIGNALS_ROOT, session_id, self_id])
    }

    pub fn session_path(session_id: &str) -> String {
        join_path(&[SIGNALS_ROOT, session_id])
    }

    /// Кладёт сигнал в ящик получателя, возвращает ключ
    pub async fn send(
        &self,
        session_id: &str,
        to_id: &str,
        from_id: &str,
        message: SignalMessage,
    ) -> Result<String, RelayError> {
        self.send_signal(session_id, &Signal::new(from_id, to_id, message)).await
    }

    pub async fn send_signal(&self, session_id: &str, signal: &Signal) -> Result<String, RelayError> {
        let value = serde_json::to_value(signal).map_err(|source| StoreError::Malformed {
            path: Self::inbox_path(session_id, &signal.to_id),
            source,
        })?;
        let path = join_path(&[SIGNALS_ROOT, session_id, signal.to_id.as_str(), signal.from_id.as_str()]);
        let key = self.store.push(&path, value).await?;
        log::debug!(
            "Sent {} {} -> {} ({}, request {:?})",
            signal.kind(),
            signal.from_id,
            signal.to_id,
            key,
            signal.request_id
        );
        Ok(key)
    }

    pub fn subscribe(&self, session_id: &str, self_id: &str) -> InboxSubscription {
        InboxSubscription {
            inner: self.store.subscribe(&Self::inbox_path(session_id, self_id)),
        }
    }

    pub async fn read_inbox(&self, session_id: &str, self_id: &str) -> Result<Inbox, RelayError> {
        let value = self.store.get(&Self::inbox_path(session_id, self_id)).await?;
        Ok(Inbox::from_value(value))
    }

    /// Удаляет один обработанный сигнал
    pub async fn ack(&self, session_id: &str, self_id: &str, envelope: &Envelope) -> Result<(), RelayError> {
        let path = join_path(&[SIGNALS_ROOT, session_id, self_id, envelope.sender(), &envelope.key]);
        self.store.remove(&path).await?;
        Ok(())
    }

    /// Очищает весь ящик
    pub async fn clear(&self, session_id: &str, self_id: &str) -> Result<(), RelayError> {
        self.store.remove(&Self::inbox_path(session_id, self_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn relay() -> (Arc<MemoryStore>, SignalRelay) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), SignalRelay::new(store))
    }

    #[test]
    fn wire_format_matches_store_documents() {
        let signal = Signal {
            from_id: "60004220001".into(),
            to_id: "fac-1".into(),
            message: SignalMessage::Offer(SessionDescription::offer("v=0")),
            timestamp: 1_700_000_000_000,
            request_id: None,
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({
                "fromId": "60004220001",
                "toId": "fac-1",
                "type": "offer",
                "payload": {"type": "offer", "sdp": "v=0"},
                "timestamp": 1_700_000_000_000i64
            })
        );

        let request: Signal = serde_json::from_value(json!({
            "fromId": "fac-1", "toId": "s1", "type": "view_request", "timestamp": 5
        }))
        .unwrap();
        assert_eq!(request.message, SignalMessage::ViewRequest);
        assert_eq!(request.request_id, None);
    }

    #[test]
    fn request_tag_travels_on_the_wire() {
        let signal = Signal::new("fac-1", "s1", SignalMessage::ViewRequest).with_request(Some(7));
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["requestId"], 7);

        let back: Signal = serde_json::from_value(value).unwrap();
        assert_eq!(back.request_id, Some(7));
        assert!(back.belongs_to(Some(7)));
        assert!(!back.belongs_to(Some(8)));
        assert!(back.belongs_to(None));
        assert!(Signal::new("a", "b", SignalMessage::ViewRequest).belongs_to(Some(8)));
    }

    #[tokio::test]
    async fn send_lands_in_recipient_inbox() {
        let (store, relay) = relay();
        let key = relay
            .send("sess", "fac-1", "stu-1", SignalMessage::ViewRequest)
            .await
            .unwrap();

        let stored = store
            .get(&format!("signals/sess/fac-1/stu-1/{}", key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["type"], "view_request");
        assert_eq!(stored["fromId"], "stu-1");
    }

    #[tokio::test]
    async fn inbox_is_grouped_and_ordered_per_sender() {
        let (_store, relay) = relay();
        let cand = |n: u16| {
            SignalMessage::Candidate(IceCandidate {
                candidate: format!("candidate:{}", n),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })
        };
        relay.send("s", "me", "b", cand(1)).await.unwrap();
        relay.send("s", "me", "a", cand(2)).await.unwrap();
        relay.send("s", "me", "b", cand(3)).await.unwrap();

        let inbox = relay.read_inbox("s", "me").await.unwrap();
        assert_eq!(inbox.len(), 3);
        assert_eq!(inbox.senders().collect::<Vec<_>>(), vec!["a", "b"]);
        let from_b: Vec<_> = inbox
            .from_sender("b")
            .iter()
            .map(|e| e.signal.message.clone())
            .collect();
        assert_eq!(from_b, vec![cand(1), cand(3)]);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let (store, relay) = relay();
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        store
            .set("signals/s/me/a/zzz", json!({"type": "offer", "payload": 3}))
            .await
            .unwrap();
        store.set("signals/s/me/b", json!("garbage")).await.unwrap();

        let inbox = relay.read_inbox("s", "me").await.unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_only_that_signal() {
        let (_store, relay) = relay();
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();

        let inbox = relay.read_inbox("s", "me").await.unwrap();
        let first = inbox.iter().next().unwrap().clone();
        relay.ack("s", "me", &first).await.unwrap();

        let inbox = relay.read_inbox("s", "me").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_ne!(inbox.iter().next().unwrap().key, first.key);

        relay.clear("s", "me").await.unwrap();
        assert!(relay.read_inbox("s", "me").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_delivers_whole_inbox() {
        let (_store, relay) = relay();
        let mut sub = relay.subscribe("s", "me");
        assert!(sub.next().await.unwrap().is_empty());

        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 1);
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn seen_set_skips_in_flight_acks_and_prunes() {
        let (_store, relay) = relay();
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        let mut seen = SeenSignals::new();

        let inbox = relay.read_inbox("s", "me").await.unwrap();
        assert_eq!(seen.unseen(&inbox).len(), 1);
        // тот же снимок (удаление ещё не дошло) - ничего нового
        assert!(seen.unseen(&inbox).is_empty());

        let first = inbox.iter().next().unwrap().clone();
        relay.ack("s", "me", &first).await.unwrap();
        relay.send("s", "me", "a", SignalMessage::ViewRequest).await.unwrap();
        let inbox = relay.read_inbox("s", "me").await.unwrap();
        assert_eq!(seen.unseen(&inbox).len(), 1);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn staleness_threshold() {
        let now = 1_700_000_100_000;
        let mut signal = Signal::new("a", "b", SignalMessage::ViewRequest);
        let limit = Duration::from_secs(10);

        signal.timestamp = now - 11_000;
        assert_eq!(check_fresh(&signal, now, limit), Err(DropReason::StaleSignal));
        signal.timestamp = now - 9_000;
        assert_eq!(check_fresh(&signal, now, limit), Ok(()));
        signal.timestamp = now - 10_000;
        assert_eq!(check_fresh(&signal, now, limit), Ok(()));
    }

    #[tokio::test]
    async fn store_failure_surfaces_relay_error() {
        let (store, relay) = relay();
        store.set_offline(true);
        let err = relay
            .send("s", "b", "a", SignalMessage::ViewRequest)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError(StoreError::Unavailable(_))));
    }
}
