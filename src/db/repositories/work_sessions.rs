use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use rusqlite::{params, Row};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{
    helpers::{parse_datetime, to_i64, to_timestamp, to_u64},
    Database,
};
use crate::models::{CaptureRef, RecordId, StoredSession, TaskId, WorkSessionRecord, WorkerId};
use crate::store::{insert_ordered, QueryError, RecordStream, SessionRecordStore, WriteError};

const SELECT_COLUMNS: &str = "SELECT id, session_id, task_id, worker_id, started_at, stopped_at,
        duration_seconds, key_press_count, captures_json, recorded_at
     FROM work_sessions";

fn row_to_stored(row: &Row) -> Result<StoredSession> {
    let session_id: String = row.get("session_id")?;
    let started_at: String = row.get("started_at")?;
    let stopped_at: String = row.get("stopped_at")?;
    let recorded_at: String = row.get("recorded_at")?;
    let duration_seconds: i64 = row.get("duration_seconds")?;
    let key_press_count: i64 = row.get("key_press_count")?;
    let captures_json: String = row.get("captures_json")?;

    let captures: Vec<CaptureRef> =
        serde_json::from_str(&captures_json).context("failed to parse captures_json")?;

    Ok(StoredSession {
        id: RecordId::new(row.get("id")?),
        recorded_at: parse_datetime(&recorded_at, "recorded_at")?,
        record: WorkSessionRecord {
            session_id: Uuid::parse_str(&session_id).context("failed to parse session_id")?,
            task_id: TaskId::new(row.get::<_, String>("task_id")?),
            worker_id: WorkerId::new(row.get::<_, String>("worker_id")?),
            started_at: parse_datetime(&started_at, "started_at")?,
            stopped_at: parse_datetime(&stopped_at, "stopped_at")?,
            duration_seconds: to_u64(duration_seconds, "duration_seconds")?,
            captures,
            key_press_count: to_u64(key_press_count, "key_press_count")?,
        },
    })
}

impl Database {
    /// Insert a completed session. Returns the stored row and whether this
    /// call created it; a second insert of the same `session_id` is a no-op.
    pub async fn insert_work_session(
        &self,
        record: &WorkSessionRecord,
    ) -> Result<(StoredSession, bool)> {
        let record = record.clone();
        self.execute(move |conn| {
            let recorded_at = Utc::now();
            let captures_json =
                serde_json::to_string(&record.captures).context("failed to serialize captures")?;
            let session_id = record.session_id.to_string();

            let inserted = conn.execute(
                "INSERT INTO work_sessions (
                    session_id, task_id, worker_id, started_at, stopped_at,
                    duration_seconds, key_press_count, captures_json, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(session_id) DO NOTHING",
                params![
                    session_id,
                    record.task_id.as_str(),
                    record.worker_id.as_str(),
                    to_timestamp(&record.started_at),
                    to_timestamp(&record.stopped_at),
                    to_i64(record.duration_seconds)?,
                    to_i64(record.key_press_count)?,
                    captures_json,
                    to_timestamp(&recorded_at),
                ],
            )?;

            if inserted == 1 {
                let recorded_at = parse_datetime(&to_timestamp(&recorded_at), "recorded_at")?;
                return Ok((
                    StoredSession {
                        id: RecordId::new(conn.last_insert_rowid()),
                        recorded_at,
                        record,
                    },
                    true,
                ));
            }

            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE session_id = ?1"))?;
            let existing = stmt
                .query_row(params![session_id], |row| Ok(row_to_stored(row)))?
                .context("failed to parse existing work session")?;
            Ok((existing, false))
        })
        .await
    }

    pub async fn list_sessions_for_task(&self, task_id: &TaskId) -> Result<Vec<StoredSession>> {
        let task_id = task_id.as_str().to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE task_id = ?1 ORDER BY recorded_at ASC, id ASC"
            ))?;

            let mut rows = stmt.query(params![task_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_stored(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    pub async fn count_sessions_for_task(&self, task_id: &TaskId) -> Result<u64> {
        let task_id = task_id.as_str().to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM work_sessions WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            to_u64(count, "count")
        })
        .await
    }

    /// Live query over one task: the current rows, then every insert for it.
    pub async fn watch_task(&self, task_id: &TaskId) -> Result<RecordStream> {
        // Subscribe before the snapshot so nothing inserted in between is missed;
        // duplicates are dropped by `insert_ordered`.
        let mut updates = self.subscribe_inserts();
        let initial = self.list_sessions_for_task(task_id).await?;
        let (tx, rx) = watch::channel(initial);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let db = self.clone();
        let task_id = task_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tx.closed() => break,
                    received = updates.recv() => match received {
                        Ok(stored) if stored.record.task_id == task_id => {
                            tx.send_if_modified(|rows| insert_ordered(rows, stored));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("viewer for task {} lagged by {} inserts; reloading", task_id, skipped);
                            match db.list_sessions_for_task(&task_id).await {
                                Ok(rows) => {
                                    tx.send_replace(rows);
                                }
                                Err(err) => warn!("reload for task {} failed: {err:#}", task_id),
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("live query for task {} detached", task_id);
        });

        Ok(RecordStream::new(rx, token.drop_guard()))
    }
}

#[async_trait]
impl SessionRecordStore for Database {
    async fn append(&self, record: &WorkSessionRecord) -> Result<RecordId, WriteError> {
        let (stored, created) = self
            .insert_work_session(record)
            .await
            .map_err(|err| WriteError::Unavailable(format!("{err:#}")))?;

        let id = stored.id;
        if created {
            info!(
                "Stored work session {} for task {} as record {}",
                stored.record.session_id, stored.record.task_id, id
            );
            self.publish_insert(stored);
        } else {
            info!(
                "Work session {} was already stored as record {}",
                stored.record.session_id, id
            );
        }
        Ok(id)
    }

    async fn stream_by_task(&self, task_id: &TaskId) -> Result<RecordStream, QueryError> {
        self.watch_task(task_id)
            .await
            .map_err(|err| QueryError::Failed(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        Database::new(dir.path().join("worktrack.sqlite3")).unwrap()
    }

    fn record(task: &str, worker: &str, duration_seconds: u64) -> WorkSessionRecord {
        let started_at = Utc::now() - Duration::seconds(duration_seconds as i64);
        WorkSessionRecord {
            session_id: Uuid::new_v4(),
            task_id: TaskId::from(task),
            worker_id: worker.into(),
            started_at,
            stopped_at: Utc::now(),
            duration_seconds,
            captures: vec![CaptureRef::new("file:///tmp/a.jpg", started_at).with_phash("abc")],
            key_press_count: 12,
        }
    }

    #[tokio::test]
    async fn append_round_trips_through_task_listing() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let written = record("gig-1", "student-7", 65);

        let id = db.append(&written).await.unwrap();
        let rows = db.list_sessions_for_task(&TaskId::from("gig-1")).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].record.duration_seconds, 65);
        assert_eq!(rows[0].record.captures, written.captures);
        assert_eq!(rows[0].record.session_id, written.session_id);
        assert!(db
            .list_sessions_for_task(&TaskId::from("gig-2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn repeated_append_of_same_session_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let written = record("gig-1", "student-7", 10);

        let first = db.append(&written).await.unwrap();
        let second = db.append(&written).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(db.count_sessions_for_task(&TaskId::from("gig-1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.append(&record("gig-1", "student-7", 10)).await.unwrap();
        }
        let db = open(&dir);
        assert_eq!(db.count_sessions_for_task(&TaskId::from("gig-1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn live_query_sees_only_its_task() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.append(&record("gig-1", "student-7", 5)).await.unwrap();

        let mut stream = db.stream_by_task(&TaskId::from("gig-1")).await.unwrap();
        assert_eq!(stream.current().len(), 1);

        db.append(&record("gig-2", "student-7", 7)).await.unwrap();
        db.append(&record("gig-1", "student-8", 9)).await.unwrap();

        let rows = stream.changed().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.record.task_id.as_str() == "gig-1"));
        assert_eq!(rows[1].record.duration_seconds, 9);
    }
}
