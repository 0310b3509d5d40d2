//! One-shot broadcast cell
//!
//! [`OnceSignal`] is set at most once and can be observed by any number of
//! waiters, blocking or async. Task outcomes and the readiness gate are both
//! built on it.

use parking_lot::{Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

struct SignalState<T> {
    value: Option<T>,
    wakers: Vec<Waker>,
}

/// A value that is published once and read many times
pub struct OnceSignal<T> {
    state: Mutex<SignalState<T>>,
    cond: Condvar,
}

impl<T> std::fmt::Debug for OnceSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceSignal")
            .field("is_set", &self.is_set())
            .finish()
    }
}

impl<T> OnceSignal<T> {
    /// Whether a value has been published
    pub fn is_set(&self) -> bool {
        self.state.lock().value.is_some()
    }
}

impl<T: Clone> OnceSignal<T> {
    /// Create an unset signal
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                value: None,
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Publish `value`; returns `false` and drops it if already set
    pub fn set(&self, value: T) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value);
            std::mem::take(&mut state.wakers)
        };
        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// The published value, if any
    pub fn get(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Block until a value is published
    pub fn wait(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.value.as_ref() {
                return value.clone();
            }
            self.cond.wait(&mut state);
        }
    }

    /// Block until a value is published or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.value.as_ref() {
                return Some(value.clone());
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.value.clone();
            }
        }
    }

    /// Poll from a future, registering the task's waker while unset
    pub fn poll_get(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock();
        if let Some(value) = state.value.as_ref() {
            return Poll::Ready(value.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Clone> Default for OnceSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_set_wins() {
        let signal = OnceSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set(1));
        assert!(!signal.set(2));
        assert_eq!(signal.get(), Some(1));
        assert_eq!(signal.wait(), 1);
    }

    #[test]
    fn test_many_waiters_see_same_value() {
        let signal = Arc::new(OnceSignal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        signal.set("done".to_string());

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), "done");
        }
    }

    #[test]
    fn test_wait_timeout() {
        let signal: OnceSignal<u8> = OnceSignal::new();
        let start = Instant::now();
        assert_eq!(signal.wait_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));

        signal.set(9);
        assert_eq!(signal.wait_timeout(Duration::from_millis(30)), Some(9));
        assert_eq!(signal.wait_timeout(Duration::MAX), Some(9));
    }

    #[test]
    fn test_debug_without_clone() {
        struct Opaque;
        let signal: OnceSignal<Opaque> = OnceSignal {
            state: Mutex::new(SignalState {
                value: Some(Opaque),
                wakers: Vec::new(),
            }),
            cond: Condvar::new(),
        };
        assert!(signal.is_set());
        assert_eq!(format!("{:?}", signal), "OnceSignal { is_set: true }");
    }
}
