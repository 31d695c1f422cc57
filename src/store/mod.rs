//! Документное хранилище (внешний коллаборатор).
//!
//! Модель - дерево JSON по путям `a/b/c`, как у realtime-базы: чтение,
//! запись, частичное обновление, удаление, push и живая подписка на путь.
//! Пустые узлы не существуют: удаление последнего ребёнка удаляет родителя.

mod memory;

pub use memory::MemoryStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// `Value::Null` удаляет узел
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Обновляет только переданные поля; `null` удаляет поле
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Добавляет ребёнка с новым упорядоченным ключом, возвращает ключ
    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Живая подписка: первое значение приходит сразу
    fn subscribe(&self, path: &str) -> Subscription;
}

/// Подписка на значение по пути. Отписка - drop.
pub struct Subscription {
    rx: watch::Receiver<Option<Value>>,
    first: bool,
}

impl Subscription {
    pub(crate) fn new(rx: watch::Receiver<Option<Value>>) -> Self {
        Self { rx, first: true }
    }

    /// Следующий снимок; `None`, когда хранилище закрыто
    pub async fn next(&mut self) -> Option<Option<Value>> {
        if self.first {
            self.first = false;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Текущее значение без ожидания
    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }
}

/// Разбивает путь на сегменты, пустые сегменты пропускаются
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Склеивает сегменты пути
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|p| segments(p))
        .collect::<Vec<_>>()
        .join("/")
}
