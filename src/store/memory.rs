use super::{segments, DocumentStore, Subscription};
use crate::errors::StoreError;
use crate::utils::push_key;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

struct Watcher {
    path: Vec<String>,
    tx: watch::Sender<Option<Value>>,
}

#[derive(Default)]
struct Inner {
    root: Map<String, Value>,
    watchers: Vec<Watcher>,
}

/// Хранилище в памяти процесса; используется тестами и desktop-оболочкой
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Эмуляция потери связи: все операции падают с `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Полный снимок дерева
    pub fn snapshot(&self) -> Value {
        Value::Object(self.lock().root.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // отравленный мьютекс не ломает дерево: все записи атомарны
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".into()));
        }
        Ok(())
    }

    fn mutate<F: FnOnce(&mut Map<String, Value>)>(&self, f: F) -> Result<(), StoreError> {
        self.check_online()?;
        let mut inner = self.lock();
        f(&mut inner.root);
        notify(&mut inner);
        Ok(())
    }
}

fn lookup<'a, S: AsRef<str>>(root: &'a Map<String, Value>, segs: &[S]) -> Option<&'a Value> {
    let (first, rest) = segs.split_first()?;
    let mut node = root.get(first.as_ref())?;
    for seg in rest {
        node = node.as_object()?.get(seg.as_ref())?;
    }
    Some(node)
}

fn value_at<S: AsRef<str>>(root: &Map<String, Value>, segs: &[S]) -> Option<Value> {
    if segs.is_empty() {
        return (!root.is_empty()).then(|| Value::Object(root.clone()));
    }
    lookup(root, segs).cloned()
}

/// Убирает null и пустые объекты; `None` - узла не существует
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            (!cleaned.is_empty()).then_some(Value::Object(cleaned))
        }
        other => Some(other),
    }
}

fn write_at(map: &mut Map<String, Value>, segs: &[&str], value: Option<Value>) {
    let Some((head, rest)) = segs.split_first() else {
        return;
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                map.insert((*head).to_owned(), v);
            }
            None => {
                map.remove(*head);
            }
        }
        return;
    }

    let child = map
        .entry((*head).to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    let now_empty = match child {
        Value::Object(child_map) => {
            write_at(child_map, rest, value);
            child_map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        map.remove(*head);
    }
}

fn write_path(root: &mut Map<String, Value>, path: &str, value: Option<Value>) {
    let segs = segments(path);
    if segs.is_empty() {
        *root = match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        return;
    }
    write_at(root, &segs, value);
}

fn notify(inner: &mut Inner) {
    let Inner { root, watchers } = inner;
    watchers.retain(|w| w.tx.receiver_count() > 0);
    for watcher in watchers.iter() {
        let current = value_at(root, &watcher.path);
        watcher.tx.send_if_modified(|old| {
            if *old != current {
                *old = current;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check_online()?;
        let inner = self.lock();
        Ok(value_at(&inner.root, &segments(path)))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let value = normalize(value);
        self.mutate(|root| write_path(root, path, value))
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.mutate(|root| {
            for (key, value) in fields {
                let full = format!("{}/{}", path, key);
                write_path(root, &full, normalize(value));
            }
        })
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.mutate(|root| write_path(root, path, None))
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let key = push_key();
        let full = format!("{}/{}", path, key);
        let value = normalize(value);
        self.mutate(|root| write_path(root, &full, value))?;
        Ok(key)
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let path: Vec<String> = segments(path).into_iter().map(str::to_owned).collect();
        let mut inner = self.lock();
        let (tx, rx) = watch::channel(value_at(&inner.root, &path));
        inner.watchers.push(Watcher { path, tx });
        Subscription::new(rx)
    }
}
