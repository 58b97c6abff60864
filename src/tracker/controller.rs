use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    time,
};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::{
    capture::{CaptureError, CaptureProvider},
    clock::{CancelHandle, TickCallback, TimerService},
    input::{InputActivityMonitor, KeyListener, Subscription},
    models::{RecordId, TaskId, WorkSessionRecord, WorkerId},
    settings::TrackerSettings,
    store::{SessionRecordStore, WriteError},
};

use super::{TrackerEvent, TrackingSession, TrackingStatus};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Collaborators the tracker drives; all are injected so tests can fake them.
#[derive(Clone)]
pub struct TrackerServices {
    pub clock: Arc<dyn TimerService>,
    pub input: Arc<dyn InputActivityMonitor>,
    pub capture: Arc<dyn CaptureProvider>,
    pub store: Arc<dyn SessionRecordStore>,
}

/// Who is tracking time against what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
}

impl Assignment {
    pub fn new(task_id: impl Into<TaskId>, worker_id: impl Into<WorkerId>) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(TrackingSession),
    /// `start` while tracking is a no-op; carries the running session.
    AlreadyTracking(TrackingSession),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// `stop` while idle is a no-op.
    NotTracking,
    Saved {
        record_id: RecordId,
        record: WorkSessionRecord,
    },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrackerError {
    /// The run ended but its record was not committed. The tracker is idle and
    /// keeps the record for [`TrackerController::retry_save`].
    #[error("failed to save work session {session_id}")]
    Persist {
        session_id: Uuid,
        #[source]
        source: WriteError,
    },
    #[error("no unsaved work session to retry")]
    NothingToRetry,
}

struct ActiveRun {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    ticker: CancelHandle,
    capture_timer: CancelHandle,
    keys: Subscription,
    captures_in_flight: TaskTracker,
}

#[derive(Default)]
struct ControlState {
    run: Option<ActiveRun>,
    unsaved: Option<WorkSessionRecord>,
}

/// One capture request bound to the run that issued it.
#[derive(Clone)]
struct CaptureJob {
    provider: Arc<dyn CaptureProvider>,
    session: Arc<StdMutex<TrackingSession>>,
    events: broadcast::Sender<TrackerEvent>,
    in_flight: TaskTracker,
    task_id: TaskId,
    session_id: Uuid,
    timeout: Duration,
}

impl CaptureJob {
    fn launch(&self) {
        let job = self.clone();
        self.in_flight.spawn(job.run());
    }

    async fn run(self) {
        let request = self.provider.request_capture(&self.task_id, self.session_id);
        let result = match time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::TimedOut(self.timeout.as_secs())),
        };

        match result {
            Ok(capture) => {
                let accepted = lock(&self.session).record_capture(self.session_id, capture.clone());
                if accepted {
                    log_info!("Capture added to session {}: {}", self.session_id, capture.url);
                    let _ = self.events.send(TrackerEvent::CaptureAdded {
                        session_id: self.session_id,
                        capture,
                    });
                } else {
                    log_warn!(
                        "Dropping capture for superseded session {}: {}",
                        self.session_id,
                        capture.url
                    );
                }
            }
            Err(err) => {
                log_warn!("Capture failed for session {}: {err}", self.session_id);
                let _ = self.events.send(TrackerEvent::CaptureFailed {
                    session_id: self.session_id,
                    permission_denied: err == CaptureError::PermissionDenied,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Work-session state machine: `Idle -> start -> Tracking -> stop -> Idle`.
///
/// Clones share one machine. `start` and `stop` are serialized, so overlapping
/// calls can never create two sets of timers.
#[derive(Clone)]
pub struct TrackerController {
    assignment: Arc<Assignment>,
    session: Arc<StdMutex<TrackingSession>>,
    control: Arc<Mutex<ControlState>>,
    services: TrackerServices,
    events: broadcast::Sender<TrackerEvent>,
    tick_interval: Duration,
    capture_interval: Duration,
    capture_timeout: Duration,
}

impl TrackerController {
    pub fn new(assignment: Assignment, settings: &TrackerSettings, services: TrackerServices) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            assignment: Arc::new(assignment),
            session: Arc::new(StdMutex::new(TrackingSession::new())),
            control: Arc::new(Mutex::new(ControlState::default())),
            services,
            events,
            tick_interval: settings.tick_interval(),
            capture_interval: settings.capture_interval(),
            capture_timeout: settings.capture_timeout(),
        }
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Current counters; while idle these are the last run's values.
    pub fn snapshot(&self) -> TrackingSession {
        lock(&self.session).clone()
    }

    pub fn status(&self) -> TrackingStatus {
        lock(&self.session).status
    }

    pub fn activity_rating(&self) -> u8 {
        lock(&self.session).activity_rating
    }

    pub async fn start(&self) -> StartOutcome {
        let mut control = self.control.lock().await;
        if control.run.is_some() {
            return StartOutcome::AlreadyTracking(self.snapshot());
        }

        if let Some(abandoned) = control.unsaved.take() {
            log_warn!(
                "Abandoning unsaved work session {} ({}s) to start a new one",
                abandoned.session_id,
                abandoned.duration_seconds
            );
        }

        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let snapshot = {
            let mut session = lock(&self.session);
            session.begin(session_id, started_at);
            session.clone()
        };

        let captures_in_flight = TaskTracker::new();
        let capture_job = CaptureJob {
            provider: Arc::clone(&self.services.capture),
            session: Arc::clone(&self.session),
            events: self.events.clone(),
            in_flight: captures_in_flight.clone(),
            task_id: self.assignment.task_id.clone(),
            session_id,
            timeout: self.capture_timeout,
        };

        let ticker = self
            .services
            .clock
            .every(self.tick_interval, self.tick_callback(session_id));
        let timer_job = capture_job.clone();
        let capture_timer = self
            .services
            .clock
            .every(self.capture_interval, Box::new(move || timer_job.launch()));
        let keys = self.services.input.subscribe(self.key_listener(session_id));

        capture_job.launch();

        control.run = Some(ActiveRun {
            session_id,
            started_at,
            ticker,
            capture_timer,
            keys,
            captures_in_flight,
        });

        log_info!(
            "Started work session {} for task {} (worker {})",
            session_id,
            self.assignment.task_id,
            self.assignment.worker_id
        );
        self.emit(TrackerEvent::StateChanged {
            session: snapshot.clone(),
        });

        StartOutcome::Started(snapshot)
    }

    pub async fn stop(&self) -> Result<StopOutcome, TrackerError> {
        let mut control = self.control.lock().await;
        let Some(run) = control.run.take() else {
            return Ok(StopOutcome::NotTracking);
        };

        let stopped_at = Utc::now();
        lock(&self.session).finish();

        run.ticker.cancel().await;
        run.capture_timer.cancel().await;
        run.keys.unsubscribe();

        run.captures_in_flight.close();
        if !run.captures_in_flight.is_empty() {
            log_info!(
                "Waiting for {} in-flight capture(s) of session {}",
                run.captures_in_flight.len(),
                run.session_id
            );
        }
        run.captures_in_flight.wait().await;

        let (snapshot, record) = {
            let session = lock(&self.session);
            let record = WorkSessionRecord {
                session_id: run.session_id,
                task_id: self.assignment.task_id.clone(),
                worker_id: self.assignment.worker_id.clone(),
                started_at: run.started_at,
                stopped_at,
                duration_seconds: session.elapsed_seconds,
                captures: session.captures.clone(),
                key_press_count: session.key_press_count,
            };
            (session.clone(), record)
        };

        log_info!(
            "Stopped work session {}: {}s, {} key presses, {} capture(s)",
            record.session_id,
            record.duration_seconds,
            record.key_press_count,
            record.captures.len()
        );
        self.emit(TrackerEvent::StateChanged { session: snapshot });

        control.unsaved = Some(record.clone());
        let record_id = self.persist(&mut control, record.clone()).await?;
        Ok(StopOutcome::Saved { record_id, record })
    }

    /// Re-submit the record of a run whose save failed.
    pub async fn retry_save(&self) -> Result<RecordId, TrackerError> {
        let mut control = self.control.lock().await;
        let Some(record) = control.unsaved.clone() else {
            return Err(TrackerError::NothingToRetry);
        };
        self.persist(&mut control, record).await
    }

    pub async fn pending_record(&self) -> Option<WorkSessionRecord> {
        self.control.lock().await.unsaved.clone()
    }

    pub async fn discard_pending(&self) -> Option<WorkSessionRecord> {
        let discarded = self.control.lock().await.unsaved.take();
        if let Some(record) = &discarded {
            log_warn!("Discarded unsaved work session {}", record.session_id);
        }
        discarded
    }

    async fn persist(
        &self,
        control: &mut ControlState,
        record: WorkSessionRecord,
    ) -> Result<RecordId, TrackerError> {
        match self.services.store.append(&record).await {
            Ok(record_id) => {
                control.unsaved = None;
                log_info!("Saved work session {} as record {}", record.session_id, record_id);
                self.emit(TrackerEvent::SessionSaved { record_id, record });
                Ok(record_id)
            }
            Err(source) => {
                log_error!("Saving work session {} failed: {source}", record.session_id);
                self.emit(TrackerEvent::SaveFailed {
                    session_id: record.session_id,
                    reason: source.to_string(),
                });
                Err(TrackerError::Persist {
                    session_id: record.session_id,
                    source,
                })
            }
        }
    }

    fn tick_callback(&self, session_id: Uuid) -> TickCallback {
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        Box::new(move || {
            let elapsed = lock(&session).record_tick(session_id);
            if let Some(elapsed_seconds) = elapsed {
                let _ = events.send(TrackerEvent::Tick {
                    session_id,
                    elapsed_seconds,
                });
            }
        })
    }

    fn key_listener(&self, session_id: Uuid) -> KeyListener {
        let session = Arc::clone(&self.session);
        let events = self.events.clone();
        Arc::new(move || {
            let counted = lock(&session).record_key_press(session_id);
            if let Some((key_press_count, activity_rating)) = counted {
                let _ = events.send(TrackerEvent::ActivityChanged {
                    session_id,
                    key_press_count,
                    activity_rating,
                });
            }
        })
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }
}

fn lock(session: &StdMutex<TrackingSession>) -> MutexGuard<'_, TrackingSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}
