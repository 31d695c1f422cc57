use super::AppState;
use crate::errors::Result;
use crate::peer::ice::check_stun_server;
use crate::peer::types::ServerConfig;
use crate::session::{occupancy, Occupancy};
use std::time::Duration;
use tauri::{command, State};

/// Сколько ждём srflx-кандидата от проверяемого сервера
const CHECK_WAIT: Duration = Duration::from_secs(5);

#[command]
pub async fn get_ice_servers(state: State<'_, AppState>) -> Result<Vec<ServerConfig>> {
    Ok(state.settings.ice_servers.clone())
}

/// Проверка доступности STUN сервера
#[command]
pub async fn check_ice_server_availability(config: ServerConfig) -> bool {
    log::info!("Checking ICE server availability: {}", config.url);
    check_stun_server(&config, CHECK_WAIT).await
}

/// Счётчики мест для панели преподавателя
#[command]
pub async fn seat_occupancy(state: State<'_, AppState>, session_id: String) -> Result<Occupancy> {
    let session = state.presence.get_session(&session_id).await?;
    Ok(session.map(|s| occupancy(&s.seats)).unwrap_or_default())
}
