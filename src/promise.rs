use crate::cell::Cell;
use crate::{Error, Result};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A callback run once when a [`Future`] becomes ready.
///
/// Any `FnOnce() + Send` closure is a listener.
pub trait Listener: Send + 'static {
    fn on_ready(self: Box<Self>);
}

impl<F> Listener for F
where
    F: FnOnce() + Send + 'static,
{
    fn on_ready(self: Box<Self>) {
        (*self)()
    }
}

/// Identifies a registered listener so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// The write side of a deferred result.
///
/// Clones of a promise write to the same cell and only the first write wins.
/// When the last clone is dropped without having written anything, every
/// future reading the cell resolves to [`Error::BrokenPromise`].
///
/// # Examples
///
/// ```
/// use promise_jobs::Promise;
/// use std::thread;
///
/// let promise = Promise::<String>::new();
/// let future = promise.future();
/// let task = thread::spawn(move || {
///     promise.set("Hi".into());
/// });
/// assert_eq!(future.get().unwrap(), "Hi");
/// task.join().expect("The task thread has panicked.");
/// ```
pub struct Promise<T> {
    producer: Arc<Producer<T>>,
}

struct Producer<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Drop for Producer<T> {
    /// If this is an unresolved producer, wake everyone with an error.
    fn drop(&mut self) {
        if self.cell.resolve(Err(Error::BrokenPromise)) {
            log::debug!("promise dropped without a value");
        }
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            producer: Arc::new(Producer {
                cell: Arc::new(Cell::new()),
            }),
        }
    }

    /// Returns a future observing this promise's cell. May be called any
    /// number of times, before or after the promise is resolved.
    pub fn future(&self) -> Future<T> {
        Future {
            cell: self.producer.cell.clone(),
        }
    }

    /// Stores `value` and wakes every waiter. Returns `false` without touching
    /// the cell if it was already resolved.
    pub fn set(&self, value: T) -> bool {
        self.resolve(Ok(Arc::new(value)))
    }

    /// Resolves the cell with `err` instead of a value. Same single-assignment
    /// rule as [`Promise::set`].
    pub fn set_error(&self, err: Error) -> bool {
        self.resolve(Err(err))
    }

    pub fn is_resolved(&self) -> bool {
        self.producer.cell.is_ready()
    }

    fn resolve(&self, outcome: Result<Arc<T>>) -> bool {
        let resolved = self.producer.cell.resolve(outcome);
        if !resolved {
            log::trace!("ignoring write to an already resolved promise");
        }
        resolved
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("cell", &self.producer.cell)
            .finish()
    }
}

/// The read side of a deferred result.
///
/// Clones are views onto the same cell: all of them observe the one value (or
/// error) the promise produced. A future can be polled, blocked on, given
/// listeners, or `.await`ed.
pub struct Future<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Future<T> {
    pub fn has_value(&self) -> bool {
        self.cell.has_value()
    }

    pub fn has_error(&self) -> bool {
        self.cell.has_error()
    }

    /// True once either a value or an error has been recorded.
    pub fn ready(&self) -> bool {
        self.cell.is_ready()
    }

    pub fn error(&self) -> Option<Error> {
        match self.cell.outcome() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// Blocks until the result is ready or `timeout` elapses. `None` or a zero
    /// timeout waits indefinitely. Returns whether the result is ready.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .and_then(|timeout| Instant::now().checked_add(timeout));
        self.cell.wait(deadline)
    }

    /// Blocks until ready and returns the shared value without cloning it.
    pub fn get_shared(&self) -> Result<Arc<T>> {
        self.cell.wait_outcome()
    }

    /// Registers `listener` to run once the result is ready. If it already is,
    /// the listener runs on this thread before `add_listener` returns.
    pub fn add_listener<L: Listener>(&self, listener: L) -> ListenerId {
        self.cell.add_listener(Box::new(listener))
    }

    /// Unregisters a listener. If the result is being delivered on another
    /// thread, waits for delivery to finish first. Returns `true` only if the
    /// listener was removed before it ran.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.cell.remove_listener(id)
    }
}

/// Blocks until every future in `futures` is ready, sharing one `timeout`
/// across the whole set. `None` or a zero timeout waits indefinitely. Returns
/// whether all of them are ready; broken promises count as ready.
pub fn wait_all<'a, T: 'a>(
    futures: impl IntoIterator<Item = &'a Future<T>>,
    timeout: Option<Duration>,
) -> bool {
    let deadline = timeout
        .filter(|timeout| !timeout.is_zero())
        .and_then(|timeout| Instant::now().checked_add(timeout));
    futures.into_iter().all(|future| future.cell.wait(deadline))
}

impl<T: Clone> Future<T> {
    /// Blocks until ready, then returns a copy of the value or the error.
    pub fn get(&self) -> Result<T> {
        self.get_shared().map(|value| T::clone(&value))
    }

    /// Non-blocking [`Future::get`]: `None` while the result is pending.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.cell
            .outcome()
            .map(|outcome| outcome.map(|value| T::clone(&value)))
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("cell", &self.cell).finish()
    }
}

impl<T: Clone> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.cell.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome.map(|value| T::clone(&value))),
            None => Poll::Pending,
        }
    }
}
