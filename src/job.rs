//! Units of work and the call-marshaling job that carries a result.
use crate::promise::{Future, Promise};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt::{self, Display};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Something a [`JobQueue`](crate::JobQueue) can run.
///
/// Queues hold jobs as `Arc<dyn Job>`, so a job stays alive while it is
/// pending or running even if the submitter dropped its own handle. A job
/// has no result of its own; [`CallJob`] layers one on top with a promise.
pub trait Job: Send + Sync {
    fn execute(&self);
}

type Call<T> = Box<dyn FnOnce() -> Result<T> + Send>;

/// A job that runs a captured call once and resolves a promise with what it
/// returns.
///
/// Errors returned by the call and panics raised inside it both end up in the
/// future; neither escapes `execute`. Dropping a call job that never ran
/// resolves its future with [`Error::Cancelled`].
pub struct CallJob<T> {
    call: Mutex<Option<Call<T>>>,
    promise: Promise<T>,
}

impl<T: Send + Sync + 'static> CallJob<T> {
    /// A job around an infallible call.
    pub fn new<F>(call: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::from_call(Box::new(move || Ok(call())))
    }

    /// A job around a call that may fail. An `Err` resolves the future with
    /// [`Error::JobFailed`] carrying the error's message.
    pub fn fallible<F, E>(call: F) -> Self
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        E: Display + 'static,
    {
        Self::from_call(Box::new(move || {
            call().map_err(|err| Error::JobFailed(err.to_string()))
        }))
    }

    /// A job that calls `method` on `target` with `args`.
    ///
    /// The arguments are moved into the job now, so later changes on the
    /// caller's side have no effect on the call. The job holds a counted
    /// reference to `target` until it is dropped.
    pub fn method<C, A, E>(
        target: Arc<C>,
        method: fn(&C, A) -> std::result::Result<T, E>,
        args: A,
    ) -> Self
    where
        C: Send + Sync + ?Sized + 'static,
        A: Send + 'static,
        E: Display + 'static,
    {
        Self::fallible(move || method(&target, args))
    }

    fn from_call(call: Call<T>) -> Self {
        Self {
            call: Mutex::new(Some(call)),
            promise: Promise::new(),
        }
    }
}

impl<T> CallJob<T> {
    /// The future this job resolves. Can be taken before or after the job is
    /// enqueued.
    pub fn get_future(&self) -> Future<T> {
        self.promise.future()
    }

    pub fn has_run(&self) -> bool {
        self.call.lock().is_none()
    }
}

impl<T: Send + Sync> Job for CallJob<T> {
    fn execute(&self) {
        // Taken under the lock so a job enqueued twice still runs once.
        let Some(call) = self.call.lock().take() else {
            log::trace!("call job already ran");
            return;
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("call job panicked: {message}");
                Err(Error::JobPanicked(message))
            }
        };

        match outcome {
            Ok(value) => self.promise.set(value),
            Err(err) => self.promise.set_error(err),
        };
    }
}

impl<T> Drop for CallJob<T> {
    fn drop(&mut self) {
        if self.call.get_mut().is_some() {
            self.promise.set_error(Error::Cancelled);
        }
    }
}

impl<T> fmt::Debug for CallJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallJob")
            .field("has_run", &self.call.lock().is_none())
            .field("promise", &self.promise)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}
