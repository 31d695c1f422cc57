use super::AppState;
use crate::errors::Result;
use crate::session::{StudentInfo, SubmissionDraft};
use crate::sharer::{self, SharerMachine, SharerSnapshot};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::time::Duration;
use tauri::{command, State};

#[command]
pub async fn occupy_seat(
    state: State<'_, AppState>,
    session_id: String,
    seat: String,
    student: StudentInfo,
) -> Result<()> {
    log::info!("occupy_seat called: {} -> {}", student.sap_id, seat);
    state.presence.occupy_seat(&session_id, &seat, &student).await
}

/// Освобождает место; трансляция, если была, останавливается
#[command]
pub async fn release_seat(state: State<'_, AppState>, session_id: String, seat: String) -> Result<()> {
    if let Ok(sharer) = state.sharer().await {
        sharer.stop_sharing().await?;
    }
    state.presence.release_seat(&session_id, &seat).await
}

#[command]
pub async fn switch_seat(
    state: State<'_, AppState>,
    session_id: String,
    old_seat: String,
    new_seat: String,
    student: StudentInfo,
) -> Result<()> {
    state
        .presence
        .switch_seat(&session_id, &old_seat, &new_seat, &student)
        .await?;
    if let Ok(sharer) = state.sharer().await {
        sharer.set_seat(new_seat).await?;
    }
    Ok(())
}

#[command]
pub async fn add_submission(
    state: State<'_, AppState>,
    session_id: String,
    seat: String,
    submission: SubmissionDraft,
) -> Result<String> {
    log::info!("add_submission called: {} on seat {}", submission.file_name, seat);
    state.presence.add_submission(&session_id, &seat, &submission).await
}

#[command]
pub async fn update_submission(
    state: State<'_, AppState>,
    session_id: String,
    seat: String,
    submission_id: String,
    fields: Map<String, Value>,
) -> Result<()> {
    state
        .presence
        .update_submission(&session_id, &seat, &submission_id, fields)
        .await
}

#[command]
pub async fn delete_submission(
    state: State<'_, AppState>,
    session_id: String,
    seat: String,
    submission_id: String,
) -> Result<()> {
    state
        .presence
        .delete_submission(&session_id, &seat, &submission_id)
        .await
}

/// Запускает машину студента; экран пока не транслируется
#[command]
pub async fn join_sharing(
    state: State<'_, AppState>,
    session_id: String,
    student_id: String,
    seat: String,
) -> Result<()> {
    log::info!("join_sharing called: {} at seat {}", student_id, seat);
    let machine = SharerMachine::new(
        session_id,
        student_id,
        seat,
        state.relay.clone(),
        state.presence.clone(),
        state.capture.clone(),
        state.factory.clone(),
        state.emitter.clone(),
        &state.settings,
    );
    state.replace_sharer(Some(sharer::spawn(machine))).await;
    Ok(())
}

#[command]
pub async fn start_sharing(state: State<'_, AppState>) -> Result<()> {
    state.sharer().await?.start_sharing().await
}

#[command]
pub async fn stop_sharing(state: State<'_, AppState>) -> Result<()> {
    state.sharer().await?.stop_sharing().await
}

#[command]
pub async fn sharer_snapshot(state: State<'_, AppState>) -> Result<SharerSnapshot> {
    state.sharer().await?.snapshot().await
}

/// Один закодированный VP8 кадр экрана
#[command]
pub async fn push_frame(state: State<'_, AppState>, frame: Vec<u8>, duration_ms: u64) -> Result<()> {
    state
        .capture
        .write_frame(Bytes::from(frame), Duration::from_millis(duration_ms))
        .await?;
    Ok(())
}

/// Пользователь нажал "прекратить показ" в системном окне
#[command]
pub async fn end_capture(state: State<'_, AppState>) -> Result<()> {
    state.capture.end();
    Ok(())
}

#[command]
pub async fn leave_sharing(state: State<'_, AppState>) -> Result<()> {
    state.replace_sharer(None).await;
    Ok(())
}
