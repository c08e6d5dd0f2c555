use super::{run_job, same_job, JobQueue, JobStatus};
use crate::config::QueueConfig;
use crate::job::Job;
use crate::QueueError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Hands jobs to a fixed set of worker threads.
///
/// Within a priority class jobs are taken in FIFO order; low priority jobs
/// only run while no normal job is waiting. Dropping the queue shuts it down.
pub struct ThreadedQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

struct Shared {
    state: Mutex<State>,
    // Signalled when a job is added or shutdown begins.
    job_added: Condvar,
    // Signalled when a job leaves the queue, run or not.
    job_done: Condvar,
}

#[derive(Default)]
struct State {
    normal: VecDeque<Arc<dyn Job>>,
    low: VecDeque<Arc<dyn Job>>,
    running: Vec<Arc<dyn Job>>,
    shutdown: bool,
}

impl State {
    fn count(&self) -> usize {
        self.normal.len() + self.low.len() + self.running.len()
    }

    fn next(&mut self) -> Option<Arc<dyn Job>> {
        self.normal.pop_front().or_else(|| self.low.pop_front())
    }

    fn take_pending(&mut self, job: &Arc<dyn Job>) -> Option<Arc<dyn Job>> {
        for queue in [&mut self.normal, &mut self.low] {
            if let Some(index) = queue.iter().position(|other| same_job(other, job)) {
                return queue.remove(index);
            }
        }
        None
    }

    fn is_running(&self, job: &Arc<dyn Job>) -> bool {
        self.running.iter().any(|other| same_job(other, job))
    }
}

impl Shared {
    fn finish(&self, job: &Arc<dyn Job>) {
        let mut state = self.state.lock();
        let index = state.running.iter().position(|other| same_job(other, job));
        let finished = index.map(|index| state.running.swap_remove(index));
        drop(state);

        self.job_done.notify_all();
        // The queue's reference is released outside the lock; dropping a job
        // may resolve promises and run listeners.
        drop(finished);
    }

    fn work(self: Arc<Self>) {
        log::debug!("job worker {:?} started", thread::current().name());
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.next() {
                        state.running.push(job.clone());
                        break job;
                    }
                    if state.shutdown {
                        log::debug!("job worker {:?} stopping", thread::current().name());
                        return;
                    }
                    self.job_added.wait(&mut state);
                }
            };

            run_job(job.as_ref());
            self.finish(&job);
        }
    }
}

impl ThreadedQueue {
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let queue = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                job_added: Condvar::new(),
                job_done: Condvar::new(),
            }),
            workers: Mutex::new(Vec::with_capacity(config.worker_count())),
            worker_count: config.worker_count(),
        };

        for index in 0..config.worker_count() {
            let mut builder = thread::Builder::new().name(config.thread_name(index));
            if let Some(stack_size) = config.thread_stack_size() {
                builder = builder.stack_size(stack_size);
            }

            let shared = queue.shared.clone();
            // On failure `queue` is dropped here, which stops the workers
            // already started.
            let handle = builder
                .spawn(move || shared.work())
                .map_err(|source| QueueError::Spawn { source })?;
            queue.workers.lock().push(handle);
        }

        Ok(queue)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Stops accepting jobs, lets the workers drain what is already queued,
    /// and joins them. Jobs enqueued afterwards are dropped without running.
    ///
    /// Calling this from a job running on this queue does not join the
    /// calling worker; it exits on its own once the queue is empty.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.job_added.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::error!("job worker exited by panic");
            }
        }
    }

    fn wait_until_done(&self, job: &Arc<dyn Job>, state: &mut parking_lot::MutexGuard<'_, State>) {
        while state.is_running(job) {
            self.shared.job_done.wait(state);
        }
    }
}

impl JobQueue for ThreadedQueue {
    fn enqueue(&self, job: Arc<dyn Job>, low_priority: bool) {
        {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                if low_priority {
                    state.low.push_back(job);
                } else {
                    state.normal.push_back(job);
                }
                drop(state);
                self.shared.job_added.notify_one();
                return;
            }
        }

        log::warn!("job enqueued on a queue that is shutting down; dropping it");
        drop(job);
    }

    fn dequeue(&self, job: &Arc<dyn Job>, wait_for_completion: bool) -> JobStatus {
        let mut state = self.shared.state.lock();
        if let Some(removed) = state.take_pending(job) {
            drop(state);
            self.shared.job_done.notify_all();
            drop(removed);
            return JobStatus::Dequeued;
        }

        if !state.is_running(job) {
            return JobStatus::NotEnqueued;
        }
        if !wait_for_completion {
            return JobStatus::Pending;
        }

        self.wait_until_done(job, &mut state);
        JobStatus::Dequeued
    }

    fn pull_and_run(&self, job: &Arc<dyn Job>, wait_for_completion: bool) -> JobStatus {
        let mut state = self.shared.state.lock();
        if let Some(pulled) = state.take_pending(job) {
            state.running.push(pulled.clone());
            drop(state);

            run_job(pulled.as_ref());
            self.shared.finish(&pulled);
            return JobStatus::Dequeued;
        }

        if !state.is_running(job) {
            return JobStatus::NotEnqueued;
        }
        if !wait_for_completion {
            return JobStatus::Pending;
        }

        self.wait_until_done(job, &mut state);
        JobStatus::Dequeued
    }

    fn wait_all(&self) {
        let mut state = self.shared.state.lock();
        while state.count() > 0 {
            self.shared.job_done.wait(&mut state);
        }
    }

    fn is_finished(&self) -> bool {
        self.shared.state.lock().count() == 0
    }

    fn queue_count(&self) -> usize {
        self.shared.state.lock().count()
    }
}

impl Drop for ThreadedQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadedQueue")
            .field("workers", &self.worker_count)
            .field("normal", &state.normal.len())
            .field("low", &state.low.len())
            .field("running", &state.running.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadedQueue;
    use crate::job::{CallJob, Job};
    use crate::queue::{JobQueue, JobStatus};
    use crate::{Error, QueueConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    fn queue(workers: usize) -> ThreadedQueue {
        ThreadedQueue::new(QueueConfig::default().workers(workers).name_prefix("test-jobs"))
            .unwrap()
    }

    /// Occupies a worker until released, so tests can control what is
    /// running.
    struct Gate {
        started: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Gate {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let gate = Arc::new(Self {
                started: Mutex::new(Some(started_tx)),
                release: Mutex::new(release_rx),
            });
            (gate, started_rx, release_tx)
        }
    }

    impl Job for Gate {
        fn execute(&self) {
            if let Some(started) = self.started.lock().unwrap().take() {
                started.send(()).unwrap();
            }
            let _ = self.release.lock().unwrap().recv();
        }
    }

    #[test]
    fn test_ten_jobs_drain() {
        let queue = queue(4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = hits.clone();
            queue.enqueue(
                Arc::new(CallJob::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })),
                false,
            );
        }
        queue.wait_all();
        assert_eq!(queue.queue_count(), 0);
        assert!(queue.is_finished());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_dequeue_running_job() {
        let queue = queue(4);
        let (gate, started, release) = Gate::new();
        let job: Arc<dyn Job> = gate;
        queue.enqueue(job.clone(), false);
        started.recv().unwrap();

        assert_eq!(queue.dequeue(&job, false), JobStatus::Pending);
        assert_eq!(queue.queue_count(), 1);
        release.send(()).unwrap();
        queue.wait_all();
        assert_eq!(queue.dequeue(&job, false), JobStatus::NotEnqueued);
    }

    #[test]
    fn test_dequeue_waits_for_running_job() {
        let queue = queue(1);
        let (gate, started, release) = Gate::new();
        let job: Arc<dyn Job> = gate;
        queue.enqueue(job.clone(), false);
        started.recv().unwrap();

        let releaser = thread::spawn(move || release.send(()).unwrap());
        assert_eq!(queue.dequeue(&job, true), JobStatus::Dequeued);
        releaser.join().unwrap();
        assert_eq!(queue.dequeue(&job, true), JobStatus::NotEnqueued);
    }

    #[test]
    fn test_dequeue_pending_job_cancels_it() {
        let queue = queue(1);
        let (gate, started, release) = Gate::new();
        queue.enqueue(gate, false);
        started.recv().unwrap();

        let call = Arc::new(CallJob::new(|| 1u32));
        let future = call.get_future();
        let job: Arc<dyn Job> = call;
        queue.enqueue(job.clone(), false);
        assert_eq!(queue.dequeue(&job, false), JobStatus::Dequeued);
        drop(job);

        release.send(()).unwrap();
        queue.wait_all();
        assert_eq!(future.get(), Err(Error::Cancelled));
    }

    #[test]
    fn test_pull_and_run_on_caller() {
        let queue = queue(1);
        let (gate, started, release) = Gate::new();
        queue.enqueue(gate, false);
        started.recv().unwrap();

        let caller = thread::current().id();
        let call = Arc::new(CallJob::new(move || thread::current().id() == caller));
        let future = call.get_future();
        let job: Arc<dyn Job> = call;
        queue.enqueue(job.clone(), true);

        assert_eq!(queue.pull_and_run(&job, true), JobStatus::Dequeued);
        assert_eq!(future.get(), Ok(true));
        assert_eq!(queue.pull_and_run(&job, true), JobStatus::NotEnqueued);

        release.send(()).unwrap();
        queue.wait_all();
    }

    #[test]
    fn test_normal_before_low_priority() {
        let queue = queue(1);
        let (gate, started, release) = Gate::new();
        queue.enqueue(gate, false);
        started.recv().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, low) in [("low", true), ("normal-1", false), ("normal-2", false)] {
            let order = order.clone();
            queue.enqueue(
                Arc::new(CallJob::new(move || order.lock().unwrap().push(name))),
                low,
            );
        }
        release.send(()).unwrap();
        queue.wait_all();
        assert_eq!(*order.lock().unwrap(), ["normal-1", "normal-2", "low"]);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        struct Exploding;
        impl Job for Exploding {
            fn execute(&self) {
                panic!("boom");
            }
        }

        let queue = queue(1);
        queue.enqueue(Arc::new(Exploding), false);
        let call = Arc::new(CallJob::new(|| 5));
        let future = call.get_future();
        queue.enqueue(call, false);
        assert_eq!(future.get(), Ok(5));
        queue.wait_all();
        assert_eq!(queue.queue_count(), 0);
    }

    #[test]
    fn test_shutdown_drains_then_rejects() {
        let queue = queue(2);
        let call = Arc::new(CallJob::new(|| 1));
        let future = call.get_future();
        queue.enqueue(call, false);
        queue.shutdown();
        assert_eq!(future.get(), Ok(1));
        assert!(queue.is_shut_down());

        let late = Arc::new(CallJob::new(|| 2));
        let late_future = late.get_future();
        queue.enqueue(late, false);
        assert_eq!(late_future.get(), Err(Error::Cancelled));
        assert!(queue.is_finished());
    }
}
