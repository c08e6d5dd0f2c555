//! Turning method calls into queued jobs.
//!
//! A component exposes an asynchronous method by wrapping the synchronous one:
//!
//! ```
//! use promise_jobs::{Dispatcher, Future};
//! use std::sync::Arc;
//!
//! struct Loader;
//!
//! impl Loader {
//!     fn load(&self, (path, lod): (String, u8)) -> Result<usize, String> {
//!         Ok(path.len() + lod as usize)
//!     }
//!
//!     fn load_async(
//!         self: &Arc<Self>,
//!         dispatcher: &Dispatcher,
//!         path: String,
//!         lod: u8,
//!     ) -> Future<usize> {
//!         dispatcher.call(self, Self::load, (path, lod))
//!     }
//! }
//!
//! let dispatcher = Dispatcher::global();
//! let loader = Arc::new(Loader);
//! let future = loader.load_async(dispatcher, "rock.png".into(), 2);
//! assert_eq!(future.get(), Ok(10));
//! ```
use crate::config::QueueConfig;
use crate::job::{CallJob, Job};
use crate::promise::Future;
use crate::queue::{InlineQueue, JobQueue, QueuePolicy};
use crate::{QueueError, Result};
use once_cell::sync::OnceCell;
use std::fmt::{self, Display};
use std::sync::Arc;

static GLOBAL: OnceCell<Dispatcher> = OnceCell::new();

/// Submits call jobs to a queue and hands back their futures.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    pub fn from_config(config: QueueConfig) -> std::result::Result<Self, QueueError> {
        QueuePolicy::from_config(config).build().map(Self::new)
    }

    /// The process-wide dispatcher. Built on first use from
    /// [`QueueConfig::from_env`] unless [`Dispatcher::install_global`] ran
    /// first. Lives until the process exits.
    pub fn global() -> &'static Dispatcher {
        GLOBAL.get_or_init(|| {
            let config = QueueConfig::from_env().unwrap_or_else(|err| {
                log::warn!("{err}; using the default job queue configuration");
                QueueConfig::default()
            });
            Self::from_config(config).unwrap_or_else(|err| {
                log::error!("{err}; falling back to running jobs inline");
                Self::new(Arc::new(InlineQueue::new()))
            })
        })
    }

    /// Makes `dispatcher` the process-wide one. Fails, handing it back, if the
    /// global dispatcher already exists.
    pub fn install_global(dispatcher: Dispatcher) -> std::result::Result<(), Dispatcher> {
        GLOBAL.set(dispatcher)
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Enqueues `job` and returns its future.
    pub fn submit<T>(&self, job: CallJob<T>, low_priority: bool) -> Future<T>
    where
        T: Send + Sync + 'static,
    {
        let future = job.get_future();
        self.queue.enqueue(Arc::new(job), low_priority);
        future
    }

    /// Runs `call` on the queue.
    pub fn spawn<T, F>(&self, call: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(CallJob::new(call), false)
    }

    /// Queues `method(target, args)` and returns immediately. `args` is
    /// moved into the job; `target` is kept alive until the job is gone.
    pub fn call<C, A, T, E>(
        &self,
        target: &Arc<C>,
        method: fn(&C, A) -> std::result::Result<T, E>,
        args: A,
    ) -> Future<T>
    where
        C: Send + Sync + ?Sized + 'static,
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Display + 'static,
    {
        self.submit(CallJob::method(target.clone(), method, args), false)
    }

    /// [`Dispatcher::call`], only run once no normal job is waiting.
    pub fn call_low_priority<C, A, T, E>(
        &self,
        target: &Arc<C>,
        method: fn(&C, A) -> std::result::Result<T, E>,
        args: A,
    ) -> Future<T>
    where
        C: Send + Sync + ?Sized + 'static,
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Display + 'static,
    {
        self.submit(CallJob::method(target.clone(), method, args), true)
    }

    /// Queues the call and blocks until it is done. If no worker has picked
    /// the job up yet it runs on the calling thread, so this does not stall
    /// when called from inside another job.
    pub fn call_and_wait<C, A, T, E>(
        &self,
        target: &Arc<C>,
        method: fn(&C, A) -> std::result::Result<T, E>,
        args: A,
    ) -> Result<T>
    where
        C: Send + Sync + ?Sized + 'static,
        A: Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Display + 'static,
    {
        let call = Arc::new(CallJob::method(target.clone(), method, args));
        let future = call.get_future();
        let job: Arc<dyn Job> = call;

        self.queue.enqueue(job.clone(), false);
        self.queue.pull_and_run(&job, true);
        drop(job);

        future.get()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_count", &self.queue.queue_count())
            .finish()
    }
}
