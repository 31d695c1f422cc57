//! LabPulse: мониторинг лабораторных сессий с P2P демонстрацией экрана.
//!
//! Преподаватель видит занятость мест и сданные работы, а также может
//! запросить живой экран любого студента (или всех сразу, сеткой).
//! Сигнализация идёт через документное хранилище, медиа - напрямую
//! между участниками по WebRTC.
//!
//! Подключение в tauri-приложении (feature `desktop`):
//! ```rust,ignore
//! tauri::Builder::default()
//!     .plugin(labpulse_lib::init())
//!     .run(tauri::generate_context!())
//!     .expect("error while running tauri application");
//! ```

pub mod capture;
pub mod config;
pub mod errors;
pub mod logger;
pub mod peer;
pub mod session;
pub mod sharer;
pub mod signaling;
pub mod store;
pub mod utils;
pub mod viewer;

#[cfg(feature = "desktop")]
pub mod commands;

pub use capture::{DisplayCapture, SampleCapture};
pub use config::Settings;
pub use errors::{CaptureError, DropReason, Error, Outcome, RelayError, Result, StoreError, TransportError};
pub use logger::{AppEvent, Emitter};
pub use session::{LabSession, Presence, Seat, SeatStatus, SessionStatus};
pub use sharer::{SharerHandle, SharerMachine, SharerState};
pub use signaling::{Signal, SignalKind, SignalMessage, SignalRelay};
pub use store::{DocumentStore, MemoryStore};
pub use viewer::{ViewMode, ViewerHandle, ViewerMachine};

#[cfg(feature = "desktop")]
use tauri::{
    plugin::{Builder, TauriPlugin},
    Manager, Runtime,
};

/// Путь к TOML с настройками берётся из этой переменной
pub const CONFIG_ENV: &str = "LABPULSE_CONFIG";

/// Tauri-плагин со всеми командами преподавателя и студента
#[cfg(feature = "desktop")]
pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("labpulse")
        .invoke_handler(tauri::generate_handler![
            // Faculty
            commands::faculty_api::start_session,
            commands::faculty_api::end_session,
            commands::faculty_api::get_session,
            commands::faculty_api::active_sessions,
            commands::faculty_api::open_viewer,
            commands::faculty_api::view_student,
            commands::faculty_api::close_view,
            commands::faculty_api::set_view_mode,
            commands::faculty_api::viewer_snapshot,
            commands::faculty_api::close_viewer,
            commands::faculty_api::update_student_marks,
            commands::faculty_api::faculty_stats,
            commands::faculty_api::session_report,
            // Student
            commands::student_api::occupy_seat,
            commands::student_api::release_seat,
            commands::student_api::switch_seat,
            commands::student_api::add_submission,
            commands::student_api::update_submission,
            commands::student_api::delete_submission,
            commands::student_api::join_sharing,
            commands::student_api::start_sharing,
            commands::student_api::stop_sharing,
            commands::student_api::sharer_snapshot,
            commands::student_api::push_frame,
            commands::student_api::end_capture,
            commands::student_api::leave_sharing,
            // Utility
            commands::util_api::get_ice_servers,
            commands::util_api::check_ice_server_availability,
            commands::util_api::seat_occupancy,
        ])
        .setup(|app, _api| {
            logger::init();
            let settings = match std::env::var(CONFIG_ENV) {
                Ok(path) => Settings::load_from_file(path)?,
                Err(_) => Settings::default(),
            };
            let state = commands::AppState::new(settings);
            commands::forward_events(app.clone(), state.emitter.subscribe());
            commands::forward_frames(app.clone(), state.emitter.subscribe_frames());
            app.manage(state);
            Ok(())
        })
        .build()
}
