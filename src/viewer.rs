//! Read-only view over the recorded work sessions of one task.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    models::{CaptureRef, RecordId, StoredSession, TaskId, WorkerId},
    store::{QueryError, RecordStream, SessionRecordStore},
    tracker::format_elapsed,
};

pub const NO_CAPTURES_LABEL: &str = "No Screenshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub record_id: RecordId,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub duration_label: String,
    pub activity_rating: u8,
    pub capture_count: usize,
    pub first_capture: Option<String>,
}

impl SessionRow {
    fn from_stored(stored: &StoredSession) -> Self {
        let record = &stored.record;
        Self {
            record_id: stored.id,
            worker_id: record.worker_id.clone(),
            started_at: record.started_at,
            duration_seconds: record.duration_seconds,
            duration_label: format_elapsed(record.duration_seconds),
            activity_rating: record.activity_rating(),
            capture_count: record.captures.len(),
            first_capture: record.captures.first().map(|capture| capture.url.clone()),
        }
    }

    pub fn capture_label(&self) -> &str {
        self.first_capture.as_deref().unwrap_or(NO_CAPTURES_LABEL)
    }
}

/// Live, read-only list of a task's sessions. Dropping the viewer (or calling
/// [`SessionViewer::detach`]) releases the underlying subscription.
pub struct SessionViewer {
    task_id: TaskId,
    worker_id: Option<WorkerId>,
    stream: RecordStream,
}

impl SessionViewer {
    pub async fn attach(
        store: &dyn SessionRecordStore,
        task_id: &TaskId,
    ) -> Result<Self, QueryError> {
        let stream = store.stream_by_task(task_id).await?;
        Ok(Self {
            task_id: task_id.clone(),
            worker_id: None,
            stream,
        })
    }

    /// Restrict the view to one worker's sessions.
    pub fn for_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn sessions(&self) -> Vec<StoredSession> {
        self.visible(self.stream.current())
    }

    pub fn rows(&self) -> Vec<SessionRow> {
        to_rows(&self.sessions())
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Every capture of the visible sessions, most recent session first.
    pub fn gallery(&self) -> Vec<CaptureRef> {
        self.sessions()
            .into_iter()
            .rev()
            .flat_map(|stored| stored.record.captures)
            .collect()
    }

    /// Wait for the store to change and return the refreshed rows; `None`
    /// once the store side has gone away.
    pub async fn next_update(&mut self) -> Option<Vec<SessionRow>> {
        let sessions = self.stream.changed().await?;
        Some(to_rows(&self.visible(sessions)))
    }

    pub fn detach(self) {
        self.stream.detach();
    }

    fn visible(&self, sessions: Vec<StoredSession>) -> Vec<StoredSession> {
        match &self.worker_id {
            Some(worker_id) => sessions
                .into_iter()
                .filter(|stored| &stored.record.worker_id == worker_id)
                .collect(),
            None => sessions,
        }
    }
}

fn to_rows(sessions: &[StoredSession]) -> Vec<SessionRow> {
    sessions.iter().map(SessionRow::from_stored).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::Database, models::WorkSessionRecord};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(task: &str, worker: &str, duration_seconds: u64, captures: &[&str]) -> WorkSessionRecord {
        let now = Utc::now();
        WorkSessionRecord {
            session_id: Uuid::new_v4(),
            task_id: TaskId::from(task),
            worker_id: worker.into(),
            started_at: now,
            stopped_at: now,
            duration_seconds,
            captures: captures.iter().map(|url| CaptureRef::new(*url, now)).collect(),
            key_press_count: 23,
        }
    }

    #[tokio::test]
    async fn empty_task_has_no_rows() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();

        let viewer = SessionViewer::attach(&db, &TaskId::from("gig-empty")).await.unwrap();

        assert!(viewer.is_empty());
        assert!(viewer.rows().is_empty());
        assert!(viewer.gallery().is_empty());
    }

    #[tokio::test]
    async fn renders_rows_and_follows_inserts() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        db.append(&record("gig-1", "ana", 3725, &[])).await.unwrap();

        let mut viewer = SessionViewer::attach(&db, &TaskId::from("gig-1")).await.unwrap();
        let rows = viewer.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].duration_label, "1h 2m 5s");
        assert_eq!(rows[0].activity_rating, 2);
        assert_eq!(rows[0].capture_label(), NO_CAPTURES_LABEL);

        db.append(&record("gig-1", "ben", 60, &["file:///one.jpg", "file:///two.jpg"]))
            .await
            .unwrap();

        let rows = viewer.next_update().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].worker_id.as_str(), "ben");
        assert_eq!(rows[1].capture_count, 2);
        assert_eq!(rows[1].capture_label(), "file:///one.jpg");
    }

    #[tokio::test]
    async fn worker_filter_and_gallery_order() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();
        db.append(&record("gig-1", "ana", 10, &["file:///a1.jpg", "file:///a2.jpg"]))
            .await
            .unwrap();
        db.append(&record("gig-1", "ben", 10, &["file:///b1.jpg"])).await.unwrap();
        db.append(&record("gig-1", "ana", 10, &["file:///a3.jpg"])).await.unwrap();

        let viewer = SessionViewer::attach(&db, &TaskId::from("gig-1"))
            .await
            .unwrap()
            .for_worker(WorkerId::from("ana"));

        assert_eq!(viewer.rows().len(), 2);
        let urls: Vec<String> = viewer.gallery().into_iter().map(|c| c.url).collect();
        assert_eq!(urls, vec!["file:///a3.jpg", "file:///a1.jpg", "file:///a2.jpg"]);
    }

    #[tokio::test]
    async fn detaching_releases_the_live_query() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("db.sqlite3")).unwrap();

        let viewer = SessionViewer::attach(&db, &TaskId::from("gig-1")).await.unwrap();
        assert_eq!(db.live_query_count(), 1);
        viewer.detach();

        for _ in 0..100 {
            if db.live_query_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(db.live_query_count(), 0);

        db.append(&record("gig-1", "ana", 1, &[])).await.unwrap();
    }
}
