mod utils;

pub mod capture;
pub mod clock;
pub mod db;
pub mod input;
pub mod models;
pub mod settings;
pub mod store;
pub mod tracker;
pub mod viewer;

pub use capture::{CaptureError, CaptureProvider};
pub use clock::{CancelHandle, TimerService, TokioClock};
pub use db::Database;
pub use input::{InputActivityMonitor, KeyEventHub, Subscription};
pub use models::{CaptureRef, RecordId, StoredSession, TaskId, WorkSessionRecord, WorkerId};
pub use settings::{SettingsStore, TrackerSettings};
pub use store::{QueryError, RecordStream, SessionRecordStore, WriteError};
pub use tracker::{
    Assignment, StartOutcome, StopOutcome, TrackerController, TrackerError, TrackerEvent,
    TrackerServices, TrackingSession, TrackingStatus,
};
pub use viewer::{SessionRow, SessionViewer};

/// Initialize logging (reads RUST_LOG; `WORKTRACK_DEBUG=1` raises the default
/// level to debug). Safe to call more than once.
pub fn init_logging() {
    let debug_mode = std::env::var("WORKTRACK_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let level = if debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}
