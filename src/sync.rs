//! Thread coordination primitives for the queue workers
//!
//! The engine is a plain OS-thread pipeline: application threads enqueue
//! requests, per-disk workers serve them. The two primitives here carry all
//! of that coordination: a counting [`Semaphore`] for "how many requests are
//! queued", and a [`SharedState`] cell that threads can set and others can
//! block on until it reaches a particular value.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore.
///
/// `acquire` blocks until the count is positive, decrements it, and returns
/// the remaining count; workers use that return value to detect a drained
/// queue during shutdown.
pub struct Semaphore {
    count: Mutex<isize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: isize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment the count by `n` and wake waiters.
    pub fn signal_n(&self, n: isize) {
        let mut count = self.count.lock();
        *count += n;
        drop(count);
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn signal(&self) {
        self.signal_n(1);
    }

    /// Block until the count is positive, then decrement. Returns the count
    /// remaining after the decrement.
    pub fn acquire(&self) -> isize {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
        *count
    }

    /// Decrement without blocking. Returns false if the count was not
    /// positive.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock();
        if *count <= 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

/// A value cell that threads can block on until it reaches a given state.
///
/// Used for the request state machine (wait until READY2DIE) and for worker
/// thread lifecycles. Waiters always re-check under the lock, so a waiter
/// registered concurrently with a `set_to` cannot miss its wakeup.
pub struct SharedState<T: Copy + Eq> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T: Copy + Eq> SharedState<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        *self.state.lock()
    }

    pub fn set_to(&self, value: T) {
        let mut state = self.state.lock();
        *state = value;
        drop(state);
        self.cond.notify_all();
    }

    /// Block until the state equals `value`.
    pub fn wait_for(&self, value: T) {
        let mut state = self.state.lock();
        while *state != value {
            self.cond.wait(&mut state);
        }
    }
}

impl<T: Copy + Eq + PartialOrd> SharedState<T> {
    /// Block until the state is at least `value`.
    pub fn wait_for_at_least(&self, value: T) {
        let mut state = self.state.lock();
        while *state < value {
            self.cond.wait(&mut state);
        }
    }
}

/// Lifecycle of a queue worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadState {
    NotRunning,
    Running,
    Terminating,
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_counts_down() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.acquire(), 1);
        assert_eq!(sem.acquire(), 0);
        assert!(!sem.try_acquire());
        sem.signal();
        assert!(sem.try_acquire());
    }

    #[test]
    fn semaphore_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || sem2.acquire());
        thread::sleep(Duration::from_millis(20));
        sem.signal();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn shared_state_wait_for() {
        let state = Arc::new(SharedState::new(ThreadState::NotRunning));
        let state2 = Arc::clone(&state);
        let handle = thread::spawn(move || {
            state2.wait_for(ThreadState::Terminated);
        });
        state.set_to(ThreadState::Running);
        state.set_to(ThreadState::Terminated);
        handle.join().unwrap();
        assert_eq!(state.get(), ThreadState::Terminated);
    }

    #[test]
    fn shared_state_wait_for_at_least() {
        let state = SharedState::new(1u8);
        state.set_to(3);
        state.wait_for_at_least(2);
    }
}
