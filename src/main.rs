use std::{
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
    thread,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::{broadcast::error::RecvError, oneshot};

use worktrack_lib::{
    capture::{ImageFileGrabber, LocalBlobStore, SnapshotCaptureProvider},
    tracker::{format_elapsed, rating_stars},
    viewer::SessionRow,
    Assignment, Database, KeyEventHub, SessionViewer, SettingsStore, StopOutcome, TaskId,
    TokioClock, TrackerController, TrackerError, TrackerEvent, TrackerServices, WorkerId,
};

#[derive(Parser)]
#[command(name = "worktrack", version, about = "Track work sessions against an assigned task")]
struct Cli {
    /// Directory holding the database, settings and stored captures
    #[arg(long, default_value = ".worktrack")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track one session. Typed input counts as key presses; EOF or Ctrl-C stops.
    Track {
        #[arg(long)]
        task: String,
        #[arg(long)]
        worker: String,
        /// Screen snapshot image to capture from (overrides settings)
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Show recorded sessions for a task
    Sessions {
        #[arg(long)]
        task: String,
        /// Only show this worker's sessions
        #[arg(long)]
        worker: Option<String>,
        /// Keep printing as new sessions are recorded
        #[arg(long)]
        follow: bool,
        /// Also list every capture URL, newest session first
        #[arg(long)]
        gallery: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    worktrack_lib::init_logging();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.data_dir).with_context(|| {
        format!("failed to create data directory {}", cli.data_dir.display())
    })?;
    let settings = SettingsStore::new(cli.data_dir.join("settings.json"))?;
    let database = Database::new(cli.data_dir.join("worktrack.sqlite3"))?;

    match cli.command {
        Command::Track {
            task,
            worker,
            snapshot,
        } => track(&cli.data_dir, &settings, database, task, worker, snapshot).await,
        Command::Sessions {
            task,
            worker,
            follow,
            gallery,
        } => sessions(database, task, worker, follow, gallery).await,
    }
}

async fn track(
    data_dir: &std::path::Path,
    settings: &SettingsStore,
    database: Database,
    task: String,
    worker: String,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let capture_settings = settings.capture();
    let snapshot_path = snapshot
        .or(capture_settings.snapshot_path)
        .unwrap_or_else(|| data_dir.join("screen.png"));
    let blob_dir = capture_settings
        .blob_dir
        .unwrap_or_else(|| data_dir.join("blobs"));
    info!(
        "Capturing from {} into {}",
        snapshot_path.display(),
        blob_dir.display()
    );

    let keyboard = KeyEventHub::new();
    let services = TrackerServices {
        clock: Arc::new(TokioClock::new()),
        input: Arc::new(keyboard.clone()),
        capture: Arc::new(SnapshotCaptureProvider::new(
            ImageFileGrabber::new(snapshot_path),
            LocalBlobStore::new(blob_dir),
        )),
        store: Arc::new(database),
    };
    let controller = TrackerController::new(
        Assignment::new(TaskId::new(task), WorkerId::new(worker)),
        &settings.tracker(),
        services,
    );

    let mut events = controller.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let eof_rx = spawn_key_reader(io::stdin(), keyboard)?;

    controller.start().await;
    println!("Tracking started. Type to register activity; Ctrl-D or Ctrl-C stops.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("Ctrl-C handler failed: {err}");
            }
        }
        _ = eof_rx => {}
    }

    let outcome = controller.stop().await;
    reporter.abort();

    match outcome {
        Ok(StopOutcome::Saved { record_id, record }) => {
            println!(
                "Saved session {} as record {}: {} | activity {} {} | {} capture(s)",
                record.session_id,
                record_id,
                format_elapsed(record.duration_seconds),
                record.activity_rating(),
                rating_stars(record.activity_rating()),
                record.captures.len()
            );
            Ok(())
        }
        Ok(StopOutcome::NotTracking) => Ok(()),
        Err(err @ TrackerError::Persist { .. }) => {
            if let Some(record) = controller.pending_record().await {
                // Keep the data recoverable even though the store rejected it.
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            Err(anyhow!(err))
        }
        Err(err) => Err(anyhow!(err)),
    }
}

/// Forward every non-newline byte of `input` to `keyboard` as a key press.
///
/// Runs on a plain thread: a blocked read must not hold up runtime shutdown
/// once tracking has stopped. The receiver resolves when `input` hits EOF.
fn spawn_key_reader<R>(mut input: R, keyboard: KeyEventHub) -> Result<oneshot::Receiver<()>>
where
    R: Read + Send + 'static,
{
    let (eof_tx, eof_rx) = oneshot::channel();
    thread::Builder::new()
        .name("worktrack-keys".into())
        .spawn(move || {
            let mut buffer = [0u8; 256];
            loop {
                match input.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(read) => {
                        for byte in &buffer[..read] {
                            if *byte != b'\n' && *byte != b'\r' {
                                keyboard.emit_key_press();
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!("Reading key input failed: {err}");
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        })
        .context("failed to spawn key input thread")?;
    Ok(eof_rx)
}

fn report(event: &TrackerEvent) {
    match event {
        TrackerEvent::Tick {
            elapsed_seconds, ..
        } if elapsed_seconds % 60 == 0 => {
            println!("Time tracked: {}", format_elapsed(*elapsed_seconds));
        }
        TrackerEvent::ActivityChanged {
            key_press_count,
            activity_rating,
            ..
        } if key_press_count % 10 == 0 => {
            println!(
                "Keyboard activity: {} {}",
                activity_rating,
                rating_stars(*activity_rating)
            );
        }
        TrackerEvent::CaptureAdded { capture, .. } => println!("Captured {}", capture.url),
        TrackerEvent::CaptureFailed {
            permission_denied,
            reason,
            ..
        } => {
            if *permission_denied {
                println!("Screen capture was denied; tracking continues without it");
            } else {
                println!("Screen capture skipped: {reason}");
            }
        }
        TrackerEvent::SaveFailed { reason, .. } => println!("Saving the session failed: {reason}"),
        _ => {}
    }
}

async fn sessions(
    database: Database,
    task: String,
    worker: Option<String>,
    follow: bool,
    gallery: bool,
) -> Result<()> {
    let mut viewer = SessionViewer::attach(&database, &TaskId::new(task)).await?;
    if let Some(worker) = worker {
        viewer = viewer.for_worker(WorkerId::new(worker));
    }

    print_rows(viewer.task_id(), &viewer.rows());
    if gallery {
        for capture in viewer.gallery() {
            println!("  {}", capture.url);
        }
    }

    if follow {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                update = viewer.next_update() => match update {
                    Some(rows) => print_rows(viewer.task_id(), &rows),
                    None => break,
                },
            }
        }
    }

    viewer.detach();
    Ok(())
}

fn print_rows(task_id: &TaskId, rows: &[SessionRow]) {
    println!("Work sessions for task {task_id}");
    if rows.is_empty() {
        println!("  (no sessions yet)");
        return;
    }
    println!(
        "  {:<20} {:>10} {:>12} {:>6}  {}",
        "Worker", "Seconds", "Duration", "Rating", "Screenshots"
    );
    for row in rows {
        println!(
            "  {:<20} {:>10} {:>12} {:>6}  {}",
            row.worker_id.as_str(),
            row.duration_seconds,
            row.duration_label,
            row.activity_rating,
            row.capture_label()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Cursor,
        sync::{
            atomic::{AtomicU64, Ordering},
            mpsc,
        },
        time::{Duration, Instant},
    };
    use worktrack_lib::InputActivityMonitor;

    /// Blocks in `read` until the paired sender is dropped.
    struct HeldOpenInput(mpsc::Receiver<()>);

    impl Read for HeldOpenInput {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[tokio::test]
    async fn key_reader_counts_bytes_and_signals_eof() {
        let keyboard = KeyEventHub::new();
        let presses = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&presses);
        let _sub = keyboard.subscribe(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let eof = spawn_key_reader(Cursor::new(b"abc\nde\r\n".to_vec()), keyboard.clone()).unwrap();
        eof.await.unwrap();

        assert_eq!(presses.load(Ordering::SeqCst), 5);
        assert_eq!(keyboard.total_key_presses(), 5);
    }

    #[test]
    fn blocked_key_reader_does_not_delay_runtime_shutdown() {
        let (release, held) = mpsc::channel::<()>();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let eof = runtime
            .block_on(async { spawn_key_reader(HeldOpenInput(held), KeyEventHub::new()) })
            .unwrap();

        let started = Instant::now();
        drop(eof);
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(release);
    }
}
