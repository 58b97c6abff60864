use std::time::Duration;

use log::error;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

pub type TickCallback = Box<dyn FnMut() + Send + 'static>;

/// Periodic scheduling primitive handed to the tracker.
pub trait TimerService: Send + Sync {
    /// Invoke `callback` once per `interval`, first one interval from now,
    /// until the returned handle is cancelled or dropped.
    fn every(&self, interval: Duration, callback: TickCallback) -> CancelHandle;
}

/// Owns one scheduled callback. Dropping the handle cancels it; `cancel`
/// additionally waits until the callback can no longer run.
pub struct CancelHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(token: CancellationToken, handle: Option<JoinHandle<()>>) -> Self {
        Self { token, handle }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!("timer task failed to join: {err}");
                }
            }
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// `TimerService` backed by tokio intervals. Must be used inside a runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioClock;

impl TokioClock {
    pub fn new() -> Self {
        Self
    }
}

impl TimerService for TokioClock {
    fn every(&self, interval: Duration, mut callback: TickCallback) -> CancelHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            // Elapsed-time accounting wants every missed tick delivered.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
        });

        CancelHandle::new(token, Some(handle))
    }
}
