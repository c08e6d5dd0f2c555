//! Job queues: one interface, an inline policy and a threaded policy.
use crate::config::QueueConfig;
use crate::job::Job;
use crate::QueueError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

mod inline;
mod threaded;

pub use inline::InlineQueue;
pub use threaded::ThreadedQueue;

/// Where a job stands, as far as a queue knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// The queue has no record of the job: never enqueued, or already done.
    NotEnqueued,
    /// Waiting to run or currently running.
    Pending,
    /// Removed from the queue by this call, or run to completion while the
    /// caller waited.
    Dequeued,
}

/// Accepts jobs and runs each of them once per `enqueue`.
///
/// Status queries are best effort: they may be stale by the time the caller
/// looks at them if other threads enqueue concurrently. No ordering is
/// promised between jobs except that normal jobs are taken before low
/// priority ones.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Arc<dyn Job>, low_priority: bool);

    /// Removes `job` if it has not started yet. If it is running, returns
    /// [`JobStatus::Pending`], or with `wait_for_completion` blocks until it
    /// finishes and returns [`JobStatus::Dequeued`].
    fn dequeue(&self, job: &Arc<dyn Job>, wait_for_completion: bool) -> JobStatus;

    /// Takes `job` off the queue and runs it on the calling thread if it has
    /// not started yet. Otherwise behaves like [`JobQueue::dequeue`].
    fn pull_and_run(&self, job: &Arc<dyn Job>, wait_for_completion: bool) -> JobStatus;

    /// Blocks until nothing is pending or running. Jobs enqueued while
    /// waiting may or may not be waited for.
    fn wait_all(&self);

    fn is_finished(&self) -> bool;

    /// Jobs pending or running.
    fn queue_count(&self) -> usize;
}

/// Which queue to build. Picked once at construction: switching an existing
/// caller from threaded to inline turns every enqueue into a nested call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePolicy {
    Inline,
    Threaded(QueueConfig),
}

impl QueuePolicy {
    pub fn from_config(config: QueueConfig) -> Self {
        if config.is_inline() {
            Self::Inline
        } else {
            Self::Threaded(config)
        }
    }

    pub fn build(self) -> Result<Arc<dyn JobQueue>, QueueError> {
        Ok(match self {
            Self::Inline => Arc::new(InlineQueue::new()),
            Self::Threaded(config) => Arc::new(ThreadedQueue::new(config)?),
        })
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Threaded(QueueConfig::default())
    }
}

pub(crate) fn same_job(a: &Arc<dyn Job>, b: &Arc<dyn Job>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Runs `job`, keeping a panic from unwinding into the queue.
pub(crate) fn run_job(job: &dyn Job) {
    if panic::catch_unwind(AssertUnwindSafe(|| job.execute())).is_err() {
        log::error!("job panicked; the queue keeps running");
    }
}
