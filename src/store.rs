//! Session record store contract.
//!
//! The tracker only ever appends; viewers only ever read through a live
//! [`RecordStream`]. The SQLite implementation lives in [`crate::db`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::DropGuard;

use crate::models::{RecordId, StoredSession, TaskId, WorkSessionRecord};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record rejected by store: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueryError {
    #[error("record query failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    /// Commit a completed session. Appending a record whose `session_id` was
    /// already committed returns the existing id instead of a duplicate.
    async fn append(&self, record: &WorkSessionRecord) -> Result<RecordId, WriteError>;

    /// Live view of every record for `task_id`, ordered by the store's write
    /// timestamp and updated on insert.
    async fn stream_by_task(&self, task_id: &TaskId) -> Result<RecordStream, QueryError>;
}

/// Receiving end of a live query. Dropping it (or calling [`detach`]) stops the
/// feeding task.
///
/// [`detach`]: RecordStream::detach
pub struct RecordStream {
    rx: watch::Receiver<Vec<StoredSession>>,
    _guard: DropGuard,
}

impl RecordStream {
    pub fn new(rx: watch::Receiver<Vec<StoredSession>>, guard: DropGuard) -> Self {
        Self { rx, _guard: guard }
    }

    pub fn current(&self) -> Vec<StoredSession> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` once the feeding side has shut down.
    pub async fn changed(&mut self) -> Option<Vec<StoredSession>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn detach(self) {}
}

/// Insert `stored` keeping `(recorded_at, id)` order; ignores ids already present.
pub fn insert_ordered(rows: &mut Vec<StoredSession>, stored: StoredSession) -> bool {
    if rows.iter().any(|row| row.id == stored.id) {
        return false;
    }
    let key = (stored.recorded_at, stored.id);
    let position = rows.partition_point(|row| (row.recorded_at, row.id) <= key);
    rows.insert(position, stored);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    fn stored(id: i64, recorded_at: DateTime<Utc>) -> StoredSession {
        StoredSession {
            id: RecordId::new(id),
            recorded_at,
            record: WorkSessionRecord {
                session_id: Uuid::new_v4(),
                task_id: TaskId::from("gig-1"),
                worker_id: "worker".into(),
                started_at: recorded_at,
                stopped_at: recorded_at,
                duration_seconds: 1,
                captures: Vec::new(),
                key_press_count: 0,
            },
        }
    }

    #[test]
    fn insert_ordered_sorts_by_write_time_and_dedupes() {
        let base = Utc::now();
        let mut rows = vec![stored(1, base), stored(3, base + Duration::seconds(10))];

        assert!(insert_ordered(&mut rows, stored(2, base + Duration::seconds(5))));
        assert!(!insert_ordered(&mut rows, stored(3, base + Duration::seconds(10))));

        let ids: Vec<i64> = rows.iter().map(|row| row.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
