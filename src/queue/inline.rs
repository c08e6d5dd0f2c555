use super::{run_job, JobQueue, JobStatus};
use crate::job::Job;
use std::sync::Arc;

/// Runs every job on the enqueuing thread before `enqueue` returns.
///
/// Nothing is ever held, so the queue is always finished and `dequeue` /
/// `pull_and_run` never find anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineQueue;

impl InlineQueue {
    pub fn new() -> Self {
        Self
    }
}

impl JobQueue for InlineQueue {
    fn enqueue(&self, job: Arc<dyn Job>, _low_priority: bool) {
        run_job(job.as_ref());
    }

    fn dequeue(&self, _job: &Arc<dyn Job>, _wait_for_completion: bool) -> JobStatus {
        JobStatus::NotEnqueued
    }

    fn pull_and_run(&self, _job: &Arc<dyn Job>, _wait_for_completion: bool) -> JobStatus {
        JobStatus::NotEnqueued
    }

    fn wait_all(&self) {}

    fn is_finished(&self) -> bool {
        true
    }

    fn queue_count(&self) -> usize {
        0
    }
}
