// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::errors::{Error, Result};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Сигналы старше этого порога отбрасываются
pub const STALE_SIGNAL_AFTER: Duration = Duration::from_secs(10);

/// Сколько ждём состояния connected до принудительного закрытия
pub const NEGOTIATION_DEADLINE: Duration = Duration::from_secs(30);

/// Публичные STUN-серверы по умолчанию
pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Настройки демонстрации экрана
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub ice_servers: Vec<ServerConfig>,
    pub stale_signal_after_ms: u64,
    /// 0 отключает дедлайн
    pub negotiation_deadline_ms: u64,
    pub sharer_rejects_stale: bool,
    pub event_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            stale_signal_after_ms: STALE_SIGNAL_AFTER.as_millis() as u64,
            negotiation_deadline_ms: NEGOTIATION_DEADLINE.as_millis() as u64,
            sharer_rejects_stale: true,
            event_capacity: 64,
        }
    }
}

impl Settings {
    /// Загружает настройки из TOML; если файла нет - дефолты
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("Settings file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {:?}: {}", path, e)))?;
        let settings = Self::from_toml(&contents)?;
        log::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Только прямые соединения и STUN, TURN не поддерживается
    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(Error::Config("at least one STUN server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Config("server URL cannot be empty".into()));
            }
            if server.r#type == "turn" || server.url.starts_with("turn:") {
                return Err(Error::Config(format!(
                    "TURN server {} is not supported, use STUN",
                    server.id
                )));
            }
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_signal_after_ms)
    }

    /// Порог устаревания для стороны студента
    pub fn sharer_stale_after(&self) -> Option<Duration> {
        self.sharer_rejects_stale.then(|| self.stale_after())
    }

    pub fn negotiation_deadline(&self) -> Option<Duration> {
        (self.negotiation_deadline_ms > 0).then(|| Duration::from_millis(self.negotiation_deadline_ms))
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_STUN_URLS
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{}", i),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}
