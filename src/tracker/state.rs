use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp;
use uuid::Uuid;

use crate::models::CaptureRef;

pub const KEYS_PER_RATING_STEP: u64 = 10;
pub const MAX_ACTIVITY_RATING: u8 = 5;

/// Coarse 0..=5 engagement score: one point per ten key presses.
pub fn activity_rating(key_press_count: u64) -> u8 {
    cmp::min(
        key_press_count / KEYS_PER_RATING_STEP,
        u64::from(MAX_ACTIVITY_RATING),
    ) as u8
}

/// `3725` -> `"1h 2m 5s"`.
pub fn format_elapsed(total_seconds: u64) -> String {
    format!(
        "{}h {}m {}s",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60
    )
}

pub fn rating_stars(rating: u8) -> String {
    "⭐".repeat(usize::from(rating.min(MAX_ACTIVITY_RATING)))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackingStatus {
    #[default]
    Idle,
    Tracking,
}

/// Live counters of the current (or most recent) tracking run.
///
/// Every mutator takes the id of the run that produced the event, so callbacks
/// left over from an older run can never touch a newer one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSession {
    pub status: TrackingStatus,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
    pub key_press_count: u64,
    pub activity_rating: u8,
    pub captures: Vec<CaptureRef>,
}

impl TrackingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracking(&self) -> bool {
        self.status == TrackingStatus::Tracking
    }

    pub fn begin(&mut self, session_id: Uuid, started_at: DateTime<Utc>) {
        *self = Self {
            status: TrackingStatus::Tracking,
            session_id: Some(session_id),
            started_at: Some(started_at),
            ..Self::default()
        };
    }

    /// Counters and captures stay readable until the next `begin`.
    pub fn finish(&mut self) {
        self.status = TrackingStatus::Idle;
    }

    fn is_current(&self, session_id: Uuid) -> bool {
        self.session_id == Some(session_id)
    }

    /// Returns the new elapsed time, or `None` if the tick was stale.
    pub fn record_tick(&mut self, session_id: Uuid) -> Option<u64> {
        if !self.is_tracking() || !self.is_current(session_id) {
            return None;
        }
        self.elapsed_seconds = self.elapsed_seconds.saturating_add(1);
        Some(self.elapsed_seconds)
    }

    /// Returns the new `(count, rating)`, or `None` if the event was stale.
    pub fn record_key_press(&mut self, session_id: Uuid) -> Option<(u64, u8)> {
        if !self.is_tracking() || !self.is_current(session_id) {
            return None;
        }
        self.key_press_count = self.key_press_count.saturating_add(1);
        self.activity_rating = activity_rating(self.key_press_count);
        Some((self.key_press_count, self.activity_rating))
    }

    /// Captures are accepted after `finish` as long as the run is still the
    /// current one: stop waits for in-flight requests before reading them.
    pub fn record_capture(&mut self, session_id: Uuid, capture: CaptureRef) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        self.captures.push(capture);
        true
    }
}
