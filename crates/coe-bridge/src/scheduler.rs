//! Periodic task scheduler
//!
//! Each scheduled job runs on its own tokio task. The first run happens one
//! full interval after scheduling, and a job never overlaps with itself: the
//! next tick is only awaited once the previous run has finished.
//!
//! Cancellation signals the job and then joins its task, so once
//! [`Scheduler::cancel`] returns the job will not fire again. A run that is
//! already in progress is allowed to complete.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// A periodic job body
pub type ScheduledTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

struct ScheduledJob {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of a set of periodic jobs
#[derive(Default)]
pub struct Scheduler {
    next_id: AtomicU64,
    jobs: Mutex<BTreeMap<TaskHandle, ScheduledJob>>,
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `interval`, starting one interval from now
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_every<F>(&self, interval: Duration, task: F) -> TaskHandle
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        // tokio rejects a zero period
        let interval = interval.max(Duration::from_millis(1));
        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task: ScheduledTask = Arc::new(task);
        let (stop_tx, stop_rx) = oneshot::channel();

        let join = tokio::spawn(run_job(handle, interval, task, stop_rx));
        self.jobs.lock().insert(
            handle,
            ScheduledJob {
                stop_tx,
                task: join,
            },
        );

        debug!(%handle, ?interval, "Scheduled periodic task");
        handle
    }

    /// Stop a job and wait until it can no longer fire
    ///
    /// Unknown or already cancelled handles are ignored.
    pub async fn cancel(&self, handle: TaskHandle) {
        let job = self.jobs.lock().remove(&handle);
        if let Some(job) = job {
            stop_job(handle, job).await;
        }
    }

    /// Stop every job
    pub async fn cancel_all(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        for (handle, job) in jobs {
            stop_job(handle, job).await;
        }
    }

    /// Number of scheduled jobs
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether no job is scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, job) in std::mem::take(self.jobs.get_mut()) {
            job.task.abort();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.len())
            .finish()
    }
}

async fn run_job(
    handle: TaskHandle,
    interval: Duration,
    task: ScheduledTask,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break,

            _ = ticker.tick() => {
                trace!(%handle, "Running periodic task");
                task().await;
            }
        }
    }
}

async fn stop_job(handle: TaskHandle, job: ScheduledJob) {
    let _ = job.stop_tx.send(());
    if let Err(e) = job.task.await {
        warn!(%handle, "Periodic task ended abnormally: {}", e);
    }
    debug!(%handle, "Cancelled periodic task");
}
