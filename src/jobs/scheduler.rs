//! Periodic retention sweep.
//!
//! Runs [`RetentionJob::sweep`] once per interval on a tokio task until
//! shutdown is requested through the channel. Overlapping runs across
//! processes are not coordinated.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

use crate::billing::retention::RetentionJob;

/// Runs the retention sweep on a fixed interval.
pub struct RetentionScheduler {
    job: RetentionJob,
    interval: Duration,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request shutdown and wait for the task to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!(target: "clinify::jobs", error = %e, "Retention scheduler task failed");
        }
    }
}

impl RetentionScheduler {
    #[must_use]
    pub fn new(job: RetentionJob, interval: Duration) -> Self {
        Self { job, interval }
    }

    /// Spawn the scheduler. The first sweep runs immediately.
    #[must_use]
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle { shutdown_tx, task }
    }

    /// Run until shutdown is requested via the channel.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(
            target: "clinify::jobs",
            interval_secs = self.interval.as_secs(),
            grace_days = self.job.grace().num_days(),
            "Retention scheduler started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(target: "clinify::jobs", "Shutdown signal received");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.job.sweep(Utc::now()).await {
                        tracing::error!(
                            target: "clinify::jobs",
                            error = %e,
                            "Retention sweep failed"
                        );
                    }
                }
            }
        }

        tracing::info!(target: "clinify::jobs", "Retention scheduler stopped");
    }
}
