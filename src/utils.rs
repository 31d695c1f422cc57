use crate::peer::types::ServerConfig;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

static PUSH_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Текущее время в миллисекундах Unix
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Ключ для push: лексикографический порядок совпадает с порядком вставки
pub fn push_key() -> String {
    let seq = PUSH_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{:013}-{:08}", now_millis().max(0), seq)
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
