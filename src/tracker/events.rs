use serde::Serialize;
use uuid::Uuid;

use crate::models::{CaptureRef, RecordId, WorkSessionRecord};

use super::TrackingSession;

/// Notifications published by the tracker for whoever renders it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TrackerEvent {
    StateChanged {
        session: TrackingSession,
    },
    Tick {
        session_id: Uuid,
        elapsed_seconds: u64,
    },
    ActivityChanged {
        session_id: Uuid,
        key_press_count: u64,
        activity_rating: u8,
    },
    CaptureAdded {
        session_id: Uuid,
        capture: CaptureRef,
    },
    /// Non-fatal: tracking carries on without this capture.
    CaptureFailed {
        session_id: Uuid,
        permission_denied: bool,
        reason: String,
    },
    SessionSaved {
        record_id: RecordId,
        record: WorkSessionRecord,
    },
    SaveFailed {
        session_id: Uuid,
        reason: String,
    },
}
