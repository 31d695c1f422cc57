use super::AppState;
use crate::errors::Result;
use crate::session::{FacultyStats, LabSession, ReportRow, SessionDraft};
use crate::viewer::{self, ViewMode, ViewerMachine, ViewerSnapshot};
use std::collections::BTreeMap;
use tauri::{command, State};

/// Новая лабораторная сессия
#[command]
pub async fn start_session(state: State<'_, AppState>, draft: SessionDraft) -> Result<String> {
    log::info!("start_session called for lab {}", draft.lab_id);
    state.presence.create_session(&draft).await
}

/// Завершает сессию; открытый просмотр останавливается
#[command]
pub async fn end_session(
    state: State<'_, AppState>,
    session_id: String,
    marks: Option<BTreeMap<String, f64>>,
) -> Result<bool> {
    log::info!("end_session called for {}", session_id);
    let ended = state
        .presence
        .end_session(&session_id, marks.unwrap_or_default())
        .await?;
    state.replace_viewer(None).await;
    Ok(ended)
}

#[command]
pub async fn get_session(state: State<'_, AppState>, session_id: String) -> Result<Option<LabSession>> {
    state.presence.get_session(&session_id).await
}

#[command]
pub async fn active_sessions(state: State<'_, AppState>) -> Result<Vec<LabSession>> {
    state.presence.active_sessions().await
}

/// Запускает машину просмотра для сессии
#[command]
pub async fn open_viewer(state: State<'_, AppState>, session_id: String, faculty_id: String) -> Result<()> {
    log::info!("open_viewer called: {} in {}", faculty_id, session_id);
    let machine = ViewerMachine::new(
        session_id,
        faculty_id,
        state.relay.clone(),
        state.factory.clone(),
        state.emitter.clone(),
        &state.settings,
    );
    let handle = viewer::spawn(machine, &state.presence);
    state.replace_viewer(Some(handle)).await;
    Ok(())
}

/// Крупный план одного студента
#[command]
pub async fn view_student(state: State<'_, AppState>, peer_id: String) -> Result<()> {
    state.viewer().await?.view_single(peer_id).await
}

#[command]
pub async fn close_view(state: State<'_, AppState>) -> Result<()> {
    state.viewer().await?.close_single().await
}

#[command]
pub async fn set_view_mode(state: State<'_, AppState>, mode: ViewMode) -> Result<()> {
    state.viewer().await?.set_mode(mode).await
}

#[command]
pub async fn viewer_snapshot(state: State<'_, AppState>) -> Result<ViewerSnapshot> {
    state.viewer().await?.snapshot().await
}

#[command]
pub async fn close_viewer(state: State<'_, AppState>) -> Result<()> {
    state.replace_viewer(None).await;
    Ok(())
}

#[command]
pub async fn update_student_marks(
    state: State<'_, AppState>,
    session_id: String,
    seat: String,
    marks: f64,
) -> Result<()> {
    state.presence.update_student_marks(&session_id, &seat, marks).await
}

/// Проведено / завершено сессий
#[command]
pub async fn faculty_stats(state: State<'_, AppState>, faculty_id: String) -> Result<FacultyStats> {
    state.presence.faculty_stats(&faculty_id).await
}

#[command]
pub async fn session_report(state: State<'_, AppState>, session_id: String) -> Result<Option<Vec<ReportRow>>> {
    state.presence.session_report(&session_id).await
}
