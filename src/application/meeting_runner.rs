use crate::application::progression::ProgressionController;
use crate::domain::models::MeetingEvent;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;
pub type SharedController = Arc<Mutex<ProgressionController>>;

pub fn system_clock() -> NowProvider {
    Arc::new(Utc::now)
}

/// Hand-advanced clock for driving a meeting without waiting on wall time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut now) => *now = instant,
            Err(poisoned) => *poisoned.into_inner() = instant,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.set(self.now() + by);
    }

    pub fn provider(&self) -> NowProvider {
        let clock = self.clone();
        Arc::new(move || clock.now())
    }
}

/// Periodic tick source for one meeting.
///
/// Owns the timer task. `stop` ends the task, waits for it, and resets the
/// controller; once it returns no further tick reaches the controller.
/// Dropping the runner without `stop` aborts the task.
pub struct MeetingRunner {
    controller: SharedController,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MeetingRunner {
    pub fn spawn(
        controller: SharedController,
        tick_interval: std::time::Duration,
        now_provider: NowProvider,
        events: mpsc::UnboundedSender<MeetingEvent>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task_controller = Arc::clone(&controller);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let now = now_provider();
                        let batch = match task_controller.lock() {
                            Ok(mut controller) => controller.tick(now),
                            Err(error) => {
                                error!(%error, "controller lock poisoned; stopping ticks");
                                break;
                            }
                        };
                        for event in batch {
                            if events.send(event).is_err() {
                                debug!("meeting event receiver dropped");
                            }
                        }
                    }
                }
            }
            debug!("tick loop exited");
        });

        info!(tick_ms = tick_interval.as_millis() as u64, "meeting runner started");
        Self {
            controller,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    error!(%error, "tick loop ended abnormally");
                }
            }
        }
        match self.controller.lock() {
            Ok(mut controller) => controller.reset(),
            Err(error) => error!(%error, "controller lock poisoned during teardown"),
        }
        info!("meeting runner stopped");
    }
}

impl Drop for MeetingRunner {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
