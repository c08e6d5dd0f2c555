//! The shared state behind one promise and all of its futures.
//!
//! Listener callbacks and wakers are never run while `state` is locked. A
//! resolving thread takes them out of the state, records itself in
//! `notifying`, unlocks, runs them, then clears `notifying` and signals
//! `delivered`. `remove_listener` waits on `delivered` so it never reports on
//! a listener that is still mid-callback.
use crate::promise::{Listener, ListenerId};
use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    task::Waker,
    thread::{self, ThreadId},
    time::Instant,
};

pub(crate) type Outcome<T> = Result<Arc<T>, Error>;

pub(crate) struct Cell<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    delivered: Condvar,
}

struct State<T> {
    outcome: Option<Outcome<T>>,
    listeners: Vec<(ListenerId, Box<dyn Listener>)>,
    wakers: Vec<Waker>,
    // The thread currently delivering listeners, if any.
    notifying: Option<ThreadId>,
    next_listener: u64,
}

impl<T> Cell<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                outcome: None,
                listeners: Vec::new(),
                wakers: Vec::new(),
                notifying: None,
                next_listener: 0,
            }),
            ready: Condvar::new(),
            delivered: Condvar::new(),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    pub(crate) fn has_value(&self) -> bool {
        matches!(self.state.lock().outcome, Some(Ok(_)))
    }

    pub(crate) fn has_error(&self) -> bool {
        matches!(self.state.lock().outcome, Some(Err(_)))
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        self.state.lock().outcome.clone()
    }

    /// Stores `outcome` if nothing was stored yet. Returns `false` and drops
    /// `outcome` otherwise.
    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> bool {
        let (listeners, wakers) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            self.ready.notify_all();

            state.notifying = Some(thread::current().id());
            (
                mem::take(&mut state.listeners),
                mem::take(&mut state.wakers),
            )
        };

        let _delivery = Delivery { cell: self };
        for waker in wakers {
            if panic::catch_unwind(AssertUnwindSafe(|| waker.wake())).is_err() {
                log::error!("future waker panicked during delivery");
            }
        }
        for (_, listener) in listeners {
            deliver(listener);
        }
        true
    }

    /// Blocks until the cell is resolved or `deadline` passes. Returns whether
    /// the cell is resolved.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.outcome.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return state.outcome.is_some();
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
        true
    }

    pub(crate) fn wait_outcome(&self) -> Outcome<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.ready.wait(&mut state);
        }
    }

    /// Returns the outcome, or registers `waker` to be woken once there is one.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        if let Some(outcome) = &state.outcome {
            return Some(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
        None
    }

    pub(crate) fn add_listener(&self, listener: Box<dyn Listener>) -> ListenerId {
        let mut state = self.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;

        if state.outcome.is_some() {
            drop(state);
            deliver(listener);
        } else {
            state.listeners.push((id, listener));
        }
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();

        // A listener removing a sibling from inside its own callback must not
        // wait on itself.
        let me = thread::current().id();
        while matches!(state.notifying, Some(thread) if thread != me) {
            self.delivered.wait(&mut state);
        }

        match state.listeners.iter().position(|(other, _)| *other == id) {
            Some(index) => {
                state.listeners.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Ends a delivery pass, even if it unwinds.
struct Delivery<'a, T> {
    cell: &'a Cell<T>,
}

impl<T> Drop for Delivery<'_, T> {
    fn drop(&mut self) {
        self.cell.state.lock().notifying = None;
        self.cell.delivered.notify_all();
    }
}

fn deliver(listener: Box<dyn Listener>) {
    if panic::catch_unwind(AssertUnwindSafe(|| listener.on_ready())).is_err() {
        log::error!("future listener panicked during delivery");
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cell")
            .field(
                "outcome",
                &match &state.outcome {
                    None => "pending",
                    Some(Ok(_)) => "value",
                    Some(Err(_)) => "error",
                },
            )
            .field("listeners", &state.listeners.len())
            .field("notifying", &state.notifying.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Cell;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::task::{Wake, Waker};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_resolve_once() {
        let cell = Cell::<u32>::new();
        assert!(cell.resolve(Ok(Arc::new(1))));
        assert!(!cell.resolve(Ok(Arc::new(2))));
        assert!(!cell.resolve(Err(Error::BrokenPromise)));
        assert_eq!(*cell.outcome().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_wait_deadline_expires() {
        let cell = Cell::<u32>::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!cell.wait(Some(deadline)));
        assert!(!cell.is_ready());
    }

    #[test]
    fn test_listener_runs_outside_lock() {
        let cell = Arc::new(Cell::<u32>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (cell2, hits2) = (cell.clone(), hits.clone());
        cell.add_listener(Box::new(move || {
            // Takes the state lock again; deadlocks if delivery holds it.
            assert!(cell2.is_ready());
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(cell.resolve(Ok(Arc::new(5))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_waits_for_delivery() {
        let cell = Arc::new(Cell::<u32>::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let id = cell.add_listener(Box::new(move || {
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));

        let resolver = {
            let cell = cell.clone();
            thread::spawn(move || cell.resolve(Ok(Arc::new(1))))
        };
        entered_rx.recv().unwrap();

        let (removed_tx, removed_rx) = mpsc::channel();
        let remover = {
            let cell = cell.clone();
            thread::spawn(move || removed_tx.send(cell.remove_listener(id)).unwrap())
        };

        // The listener is still mid-callback, so removal must not return yet.
        assert_eq!(
            removed_rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Timeout)
        );

        release_tx.send(()).unwrap();
        assert_eq!(removed_rx.recv_timeout(Duration::from_secs(5)), Ok(false));
        assert!(resolver.join().unwrap());
        remover.join().unwrap();
    }

    #[test]
    fn test_panicking_waker_ends_delivery() {
        struct Exploding;
        impl Wake for Exploding {
            fn wake(self: Arc<Self>) {
                panic!("waker exploded");
            }
        }

        let cell = Arc::new(Cell::<u32>::new());
        let waker = Waker::from(Arc::new(Exploding));
        assert!(cell.poll_outcome(&waker).is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let id = cell.add_listener(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(cell.resolve(Ok(Arc::new(2))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (removed_tx, removed_rx) = mpsc::channel();
        let remover = {
            let cell = cell.clone();
            thread::spawn(move || removed_tx.send(cell.remove_listener(id)).unwrap())
        };
        assert_eq!(removed_rx.recv_timeout(Duration::from_secs(5)), Ok(false));
        remover.join().unwrap();
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let cell = Cell::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        cell.add_listener(Box::new(|| panic!("listener exploded")));
        let hits2 = hits.clone();
        cell.add_listener(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(cell.resolve(Ok(Arc::new(3))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Delivery state was cleared, so removal returns immediately.
        assert!(!cell.remove_listener(super::ListenerId(0)));
    }
}
