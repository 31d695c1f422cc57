//! Сессии и места: кто присутствует и кто транслирует экран.
//!
//! Документы лежат в хранилище:
//! - `sessions/{sessionId}` - сессия вместе с `seats/{seatNumber}`
//! - `activeLabSessions/{labId}` - id активной сессии лаборатории

use crate::errors::{Result, StoreError};
use crate::signaling::SignalRelay;
use crate::store::{join_path, DocumentStore, Subscription};
use crate::utils::{now_millis, push_key};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const SESSIONS_ROOT: &str = "sessions";
pub const ACTIVE_ROOT: &str = "activeLabSessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    #[default]
    Empty,
    Occupied,
    Submitted,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Submission {
    pub submission_id: String,
    pub file_name: String,
    pub file_url: String,
    pub file_size: u64,
    pub file_type: String,
    pub uploaded_at: i64,
}

/// Метаданные загруженного файла (сам файл уже в blob-хранилище)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDraft {
    pub file_name: String,
    pub file_url: String,
    pub file_size: u64,
    pub file_type: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Seat {
    pub status: SeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    pub is_sharing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupied_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switched_at: Option<i64>,
    pub submissions: BTreeMap<String, Submission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<f64>,
}

impl Seat {
    pub fn is_occupied(&self) -> bool {
        self.status != SeatStatus::Empty && self.student_id.is_some()
    }
}

/// Номер места → место
pub type SeatMap = BTreeMap<String, Seat>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInfo {
    pub sap_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDraft {
    pub title: String,
    pub subject: String,
    pub lab_id: String,
    pub faculty_id: String,
    pub faculty_name: String,
    pub year: String,
    pub division: String,
    pub semester: String,
    pub assignment_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LabSession {
    pub session_id: String,
    pub title: String,
    pub subject: String,
    pub lab_id: String,
    pub faculty_id: String,
    pub faculty_name: String,
    pub year: String,
    pub division: String,
    pub semester: String,
    pub assignment_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_file_url: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub marks: BTreeMap<String, f64>,
    pub seats: SeatMap,
}

impl LabSession {
    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }
}

/// Студенты, которые сидят на месте и транслируют экран
pub fn sharing_peers(seats: &SeatMap) -> BTreeSet<String> {
    seats
        .values()
        .filter(|seat| seat.is_occupied() && seat.is_sharing)
        .filter_map(|seat| seat.student_id.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    pub working: usize,
    pub submitted: usize,
    pub occupied: usize,
}

/// Счётчики для панели преподавателя
pub fn occupancy(seats: &SeatMap) -> Occupancy {
    seats.values().filter(|s| s.is_occupied()).fold(Occupancy::default(), |mut acc, seat| {
        acc.occupied += 1;
        match seat.status {
            SeatStatus::Occupied => acc.working += 1,
            SeatStatus::Submitted => acc.submitted += 1,
            SeatStatus::Empty => {}
        }
        acc
    })
}

/// Статистика преподавателя для панели
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacultyStats {
    pub completed: usize,
    pub total: usize,
}

/// Строка ведомости сессии
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub seat_number: String,
    pub sap_id: String,
    pub student_name: String,
    pub submissions: usize,
    pub marks: f64,
    pub status: SeatStatus,
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> std::result::Result<T, StoreError> {
    serde_json::from_value(value).map_err(|source| StoreError::Malformed {
        path: path.to_owned(),
        source,
    })
}

fn encode<T: Serialize>(path: &str, value: &T) -> std::result::Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Malformed {
        path: path.to_owned(),
        source,
    })
}

/// Живые снимки одной сессии
pub struct SessionSubscription {
    path: String,
    inner: Subscription,
}

impl SessionSubscription {
    /// `Some(None)` - сессии нет; `None` - хранилище закрыто.
    /// Битые снимки пропускаются.
    pub async fn next(&mut self) -> Option<Option<LabSession>> {
        loop {
            match self.inner.next().await? {
                None => return Some(None),
                Some(value) => match decode::<LabSession>(&self.path, value) {
                    Ok(session) => return Some(Some(session)),
                    Err(e) => log::warn!("Skipping session snapshot: {}", e),
                },
            }
        }
    }
}

#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn DocumentStore>,
}

impl Presence {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn session_path(session_id: &str) -> String {
        join_path(&[SESSIONS_ROOT, session_id])
    }

    fn seat_path(session_id: &str, seat: &str) -> String {
        join_path(&[SESSIONS_ROOT, session_id, "seats", seat])
    }

    pub async fn create_session(&self, draft: &SessionDraft) -> Result<String> {
        let session_id = push_key();
        let path = Self::session_path(&session_id);
        let session = LabSession {
            session_id: session_id.clone(),
            title: draft.title.clone(),
            subject: draft.subject.clone(),
            lab_id: draft.lab_id.clone(),
            faculty_id: draft.faculty_id.clone(),
            faculty_name: draft.faculty_name.clone(),
            year: draft.year.clone(),
            division: draft.division.clone(),
            semester: draft.semester.clone(),
            assignment_count: draft.assignment_count,
            reference_file_url: draft.reference_file_url.clone(),
            status: SessionStatus::Active,
            created_at: now_millis(),
            ..Default::default()
        };
        self.store.set(&path, encode(&path, &session)?).await?;
        self.store
            .set(&join_path(&[ACTIVE_ROOT, &draft.lab_id]), json!(session_id))
            .await?;
        log::info!("Created session {} for lab {}", session_id, draft.lab_id);
        Ok(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<LabSession>> {
        let path = Self::session_path(session_id);
        match self.store.get(&path).await? {
            Some(value) => Ok(Some(decode(&path, value)?)),
            None => Ok(None),
        }
    }

    pub async fn active_session_for_lab(&self, lab_id: &str) -> Result<Option<LabSession>> {
        let pointer = self.store.get(&join_path(&[ACTIVE_ROOT, lab_id])).await?;
        match pointer {
            Some(Value::String(session_id)) => self.get_session(&session_id).await,
            _ => Ok(None),
        }
    }

    /// Все читаемые сессии; битые документы пропускаются
    async fn all_sessions(&self) -> Result<Vec<LabSession>> {
        let Some(Value::Object(all)) = self.store.get(SESSIONS_ROOT).await? else {
            return Ok(Vec::new());
        };
        let sessions = all
            .into_iter()
            .filter_map(|(id, value)| match decode::<LabSession>(&Self::session_path(&id), value) {
                Ok(session) => Some(session),
                Err(e) => {
                    log::warn!("Skipping session {}: {}", id, e);
                    None
                }
            })
            .collect();
        Ok(sessions)
    }

    pub async fn active_sessions(&self) -> Result<Vec<LabSession>> {
        let mut sessions = self.all_sessions().await?;
        sessions.retain(|s| s.status == SessionStatus::Active);
        Ok(sessions)
    }

    /// Сколько сессий провёл преподаватель и сколько из них завершено
    pub async fn faculty_stats(&self, faculty_id: &str) -> Result<FacultyStats> {
        let stats = self
            .all_sessions()
            .await?
            .iter()
            .filter(|s| s.faculty_id == faculty_id)
            .fold(FacultyStats::default(), |mut acc, session| {
                acc.total += 1;
                if session.is_ended() {
                    acc.completed += 1;
                }
                acc
            });
        Ok(stats)
    }

    /// Завершает сессию; `false`, если её нет
    pub async fn end_session(&self, session_id: &str, marks: BTreeMap<String, f64>) -> Result<bool> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(false);
        };

        let mut update = Map::new();
        update.insert("status".into(), json!(SessionStatus::Ended));
        update.insert("endedAt".into(), json!(now_millis()));
        update.insert("marks".into(), json!(marks));
        self.store.update(&Self::session_path(session_id), update).await?;

        let pointer_path = join_path(&[ACTIVE_ROOT, &session.lab_id]);
        // указатель мог уже смениться на новую сессию этой лаборатории
        if self.store.get(&pointer_path).await? == Some(json!(session_id)) {
            self.store.remove(&pointer_path).await?;
        }
        self.store.remove(&SignalRelay::session_path(session_id)).await?;
        log::info!("Ended session {}", session_id);
        Ok(true)
    }

    pub async fn occupy_seat(&self, session_id: &str, seat: &str, student: &StudentInfo) -> Result<()> {
        let path = Self::seat_path(session_id, seat);
        let doc = Seat {
            status: SeatStatus::Occupied,
            student_id: Some(student.sap_id.clone()),
            student_name: Some(student.name.clone()),
            occupied_at: Some(now_millis()),
            ..Default::default()
        };
        self.store.set(&path, encode(&path, &doc)?).await?;
        Ok(())
    }

    pub async fn release_seat(&self, session_id: &str, seat: &str) -> Result<()> {
        let mut update = Map::new();
        update.insert("status".into(), json!(SeatStatus::Empty));
        update.insert("studentId".into(), Value::Null);
        update.insert("studentName".into(), Value::Null);
        update.insert("isSharing".into(), json!(false));
        self.store.update(&Self::seat_path(session_id, seat), update).await?;
        Ok(())
    }

    /// Переезд на другое место с сохранением сданных работ
    pub async fn switch_seat(
        &self,
        session_id: &str,
        old_seat: &str,
        new_seat: &str,
        student: &StudentInfo,
    ) -> Result<()> {
        let old_path = Self::seat_path(session_id, old_seat);
        let mut seat: Seat = match self.store.get(&old_path).await? {
            Some(value) => decode(&old_path, value)?,
            None => Seat::default(),
        };
        if seat.status == SeatStatus::Empty {
            seat.status = SeatStatus::Occupied;
        }
        seat.student_id = Some(student.sap_id.clone());
        seat.student_name = Some(student.name.clone());
        seat.switched_at = Some(now_millis());

        let new_path = Self::seat_path(session_id, new_seat);
        self.store.set(&new_path, encode(&new_path, &seat)?).await?;
        self.store
            .set(&old_path, json!({ "status": SeatStatus::Empty }))
            .await?;
        log::info!("{} moved from seat {} to {}", student.sap_id, old_seat, new_seat);
        Ok(())
    }

    /// Флаг трансляции экрана на месте студента
    pub async fn set_sharing(&self, session_id: &str, seat: &str, sharing: bool) -> Result<()> {
        let mut update = Map::new();
        update.insert("isSharing".into(), json!(sharing));
        self.store.update(&Self::seat_path(session_id, seat), update).await?;
        Ok(())
    }

    pub async fn add_submission(&self, session_id: &str, seat: &str, draft: &SubmissionDraft) -> Result<String> {
        let submission_id = push_key();
        let seat_path = Self::seat_path(session_id, seat);
        let path = join_path(&[seat_path.as_str(), "submissions", submission_id.as_str()]);
        let submission = Submission {
            submission_id: submission_id.clone(),
            file_name: draft.file_name.clone(),
            file_url: draft.file_url.clone(),
            file_size: draft.file_size,
            file_type: draft.file_type.clone(),
            uploaded_at: now_millis(),
        };
        self.store.set(&path, encode(&path, &submission)?).await?;

        let mut update = Map::new();
        update.insert("status".into(), json!(SeatStatus::Submitted));
        self.store.update(&seat_path, update).await?;
        Ok(submission_id)
    }

    pub async fn delete_submission(&self, session_id: &str, seat: &str, submission_id: &str) -> Result<()> {
        let seat_path = Self::seat_path(session_id, seat);
        let path = join_path(&[seat_path.as_str(), "submissions", submission_id]);
        self.store.remove(&path).await?;
        Ok(())
    }

    pub async fn update_student_marks(&self, session_id: &str, seat: &str, marks: f64) -> Result<()> {
        let mut update = Map::new();
        update.insert("marks".into(), json!(marks));
        self.store.update(&Self::seat_path(session_id, seat), update).await?;
        Ok(())
    }

    /// Частичное обновление метаданных сданной работы
    pub async fn update_submission(
        &self,
        session_id: &str,
        seat: &str,
        submission_id: &str,
        fields: Map<String, Value>,
    ) -> Result<()> {
        let seat_path = Self::seat_path(session_id, seat);
        let path = join_path(&[seat_path.as_str(), "submissions", submission_id]);
        self.store.update(&path, fields).await?;
        Ok(())
    }

    /// Ведомость по занятым местам; `None`, если сессии нет
    pub async fn session_report(&self, session_id: &str) -> Result<Option<Vec<ReportRow>>> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let rows = session
            .seats
            .into_iter()
            .filter_map(|(seat_number, seat)| {
                let sap_id = seat.student_id?;
                Some(ReportRow {
                    seat_number,
                    sap_id,
                    student_name: seat.student_name.unwrap_or_default(),
                    submissions: seat.submissions.len(),
                    marks: seat.marks.unwrap_or(0.0),
                    status: seat.status,
                })
            })
            .collect();
        Ok(Some(rows))
    }

    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        let path = Self::session_path(session_id);
        let inner = self.store.subscribe(&path);
        SessionSubscription { path, inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalMessage;
    use crate::store::MemoryStore;

    fn draft() -> SessionDraft {
        SessionDraft {
            title: "Pointers".into(),
            subject: "C Programming".into(),
            lab_id: "lab-3".into(),
            faculty_id: "fac-1".into(),
            faculty_name: "R. Shah".into(),
            year: "SE".into(),
            division: "B".into(),
            semester: "3".into(),
            assignment_count: 2,
            reference_file_url: None,
        }
    }

    fn student(id: &str) -> StudentInfo {
        StudentInfo {
            sap_id: id.into(),
            name: format!("Student {}", id),
        }
    }

    fn presence() -> (Arc<MemoryStore>, Presence) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Presence::new(store))
    }

    #[tokio::test]
    async fn create_and_look_up_active_session() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();

        let session = presence.active_session_for_lab("lab-3").await.unwrap().unwrap();
        assert_eq!(session.session_id, id);
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.seats.is_empty());
        assert_eq!(presence.active_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sharing_peers_follow_seat_flags() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        presence.occupy_seat(&id, "1", &student("600")).await.unwrap();
        presence.occupy_seat(&id, "2", &student("601")).await.unwrap();
        presence.set_sharing(&id, "2", true).await.unwrap();

        let session = presence.get_session(&id).await.unwrap().unwrap();
        assert_eq!(sharing_peers(&session.seats), BTreeSet::from(["601".to_string()]));

        presence.release_seat(&id, "2").await.unwrap();
        let session = presence.get_session(&id).await.unwrap().unwrap();
        assert!(sharing_peers(&session.seats).is_empty());
        assert_eq!(session.seats["2"].student_id, None);
    }

    #[tokio::test]
    async fn switch_seat_keeps_submissions() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        let me = student("600");
        presence.occupy_seat(&id, "4", &me).await.unwrap();
        let sub_id = presence
            .add_submission(
                &id,
                "4",
                &SubmissionDraft {
                    file_name: "a1.c".into(),
                    file_url: "https://files.example/a1.c".into(),
                    file_size: 812,
                    file_type: "text/x-c".into(),
                },
            )
            .await
            .unwrap();

        presence.switch_seat(&id, "4", "9", &me).await.unwrap();

        let session = presence.get_session(&id).await.unwrap().unwrap();
        let moved = &session.seats["9"];
        assert_eq!(moved.status, SeatStatus::Submitted);
        assert_eq!(moved.submissions[&sub_id].file_name, "a1.c");
        assert!(moved.switched_at.is_some());
        assert_eq!(session.seats["4"].status, SeatStatus::Empty);
        assert!(session.seats["4"].submissions.is_empty());

        let counts = occupancy(&session.seats);
        assert_eq!(counts, Occupancy { working: 0, submitted: 1, occupied: 1 });
    }

    #[tokio::test]
    async fn end_session_clears_pointer_and_signals() {
        let (store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        SignalRelay::new(store.clone())
            .send(&id, "fac-1", "600", SignalMessage::ViewRequest)
            .await
            .unwrap();

        let marks = BTreeMap::from([("600".to_string(), 8.5)]);
        assert!(presence.end_session(&id, marks).await.unwrap());

        let session = presence.get_session(&id).await.unwrap().unwrap();
        assert!(session.is_ended());
        assert!(session.ended_at.is_some());
        assert_eq!(session.marks["600"], 8.5);
        assert!(presence.active_session_for_lab("lab-3").await.unwrap().is_none());
        assert_eq!(store.get("signals").await.unwrap(), None);

        assert!(!presence.end_session("missing", BTreeMap::new()).await.unwrap());
    }

    #[tokio::test]
    async fn subscription_reports_session_changes() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        let mut sub = presence.subscribe(&id);
        assert!(sub.next().await.unwrap().is_some());

        presence.update_student_marks(&id, "1", 7.0).await.unwrap();
        let session = sub.next().await.unwrap().unwrap();
        assert_eq!(session.seats["1"].marks, Some(7.0));
    }

    #[tokio::test]
    async fn submission_metadata_can_be_patched() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        presence.occupy_seat(&id, "2", &student("610")).await.unwrap();
        let sub_id = presence
            .add_submission(
                &id,
                "2",
                &SubmissionDraft {
                    file_name: "lab.c".into(),
                    file_url: "https://files.example/lab.c".into(),
                    file_size: 100,
                    file_type: "text/x-c".into(),
                },
            )
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("fileName".into(), json!("lab_v2.c"));
        fields.insert("fileSize".into(), json!(240));
        presence.update_submission(&id, "2", &sub_id, fields).await.unwrap();

        let session = presence.get_session(&id).await.unwrap().unwrap();
        let sub = &session.seats["2"].submissions[&sub_id];
        assert_eq!(sub.file_name, "lab_v2.c");
        assert_eq!(sub.file_size, 240);
        assert_eq!(sub.file_url, "https://files.example/lab.c");
    }

    #[tokio::test]
    async fn faculty_stats_count_own_sessions() {
        let (_store, presence) = presence();
        let first = presence.create_session(&draft()).await.unwrap();
        presence.create_session(&draft()).await.unwrap();
        let other = SessionDraft {
            faculty_id: "fac-2".into(),
            ..draft()
        };
        presence.create_session(&other).await.unwrap();
        presence.end_session(&first, BTreeMap::new()).await.unwrap();

        let stats = presence.faculty_stats("fac-1").await.unwrap();
        assert_eq!(stats, FacultyStats { completed: 1, total: 2 });
        assert_eq!(presence.faculty_stats("nobody").await.unwrap(), FacultyStats::default());
    }

    #[tokio::test]
    async fn report_lists_occupied_seats() {
        let (_store, presence) = presence();
        let id = presence.create_session(&draft()).await.unwrap();
        presence.occupy_seat(&id, "1", &student("600")).await.unwrap();
        presence.occupy_seat(&id, "2", &student("601")).await.unwrap();
        presence.release_seat(&id, "2").await.unwrap();
        presence.update_student_marks(&id, "1", 9.0).await.unwrap();

        let rows = presence.session_report(&id).await.unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sap_id, "600");
        assert_eq!(rows[0].marks, 9.0);
        assert_eq!(rows[0].submissions, 0);
        assert!(presence.session_report("missing").await.unwrap().is_none());
    }
}
