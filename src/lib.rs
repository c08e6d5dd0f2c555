//! Deferred results and job queues.
//!
//! A [`Promise`] is the write side of a single deferred value and a [`Future`]
//! is its read side. Work is wrapped in a [`Job`] and handed to a [`JobQueue`],
//! which runs it either inline or on worker threads. [`CallJob`] glues the two
//! together: it runs a captured call and resolves a promise with the outcome,
//! and [`Dispatcher`] turns "call this method on that component" into "enqueue
//! a job and hand back a future".
//!
//! # Examples
//!
//! ```
//! use promise_jobs::{Promise, ThreadedQueue, QueueConfig, JobQueue, CallJob};
//! use std::sync::Arc;
//!
//! let queue = ThreadedQueue::new(QueueConfig::default().workers(2)).unwrap();
//! let job = Arc::new(CallJob::new(|| 6 * 7));
//! let future = job.get_future();
//! queue.enqueue(job, false);
//! assert_eq!(future.get(), Ok(42));
//!
//! let promise = Promise::new();
//! let future = promise.future();
//! assert!(promise.set(String::from("hi")));
//! assert_eq!(future.get().unwrap(), "hi");
//! ```
mod cell;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod promise;
pub mod queue;

pub use config::QueueConfig;
pub use dispatch::Dispatcher;
pub use job::{CallJob, Job};
pub use promise::{wait_all, Future, Listener, ListenerId, Promise};
pub use queue::{InlineQueue, JobQueue, JobStatus, QueuePolicy, ThreadedQueue};

use thiserror::Error;

/// The error outcome stored in a resolved cell. Every [`Future`] reading the
/// cell gets its own copy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("the promise was dropped before a value was set")]
    BrokenPromise,
    #[error("the job failed: {0}")]
    JobFailed(String),
    #[error("the job panicked: {0}")]
    JobPanicked(String),
    #[error("the job was dropped before it ran")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building a queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to spawn worker thread")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
}
