//! Binary readiness signals with timed waits.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A binary condition that threads can set, clear and wait on.
///
/// Waits never fail: a lapsed timeout just reports the signal as unset.
#[derive(Debug, Default)]
pub struct Signal {
    set: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.lock() = true;
        self.changed.notify_all();
    }

    pub fn clear(&self) {
        *self.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Blocks until the signal is set or `timeout` elapses; returns whether it is set.
    ///
    /// A timeout too large to form a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut set = self.lock();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            set = match self.changed.wait_timeout(set, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Blocks until the signal is set.
    pub fn wait(&self) {
        let mut set = self.lock();
        while !*set {
            set = match self.changed.wait(set) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_timeout_unbounded() {
        let signal = Arc::new(Signal::new());
        signal.set();
        assert!(signal.wait_timeout(Duration::MAX));

        signal.clear();
        let setter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(signal.wait_timeout(Duration::MAX));
        handle.join().unwrap();
    }

    #[test]
    fn test_set_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let setter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_clear() {
        let signal = Signal::new();
        signal.set();
        assert!(signal.is_set());
        signal.clear();
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::ZERO));
    }
}
