//! Bounded, signal-gated retries.

use std::time::Duration;

use crate::signal::Signal;

/// Runs `attempt` up to `attempts` times, waiting up to `delay` on `signal`
/// after each one.
///
/// Stops as soon as the signal is observed set and returns whether it was set
/// by the end of the loop. `attempt` receives the 1-based attempt number.
pub fn retry<F>(signal: &Signal, attempts: u32, delay: Duration, mut attempt: F) -> bool
where
    F: FnMut(u32),
{
    for n in 1..=attempts {
        attempt(n);
        if signal.wait_timeout(delay) {
            return true;
        }
    }
    signal.is_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_attempts() {
        let signal = Signal::new();
        let mut calls = 0;
        let ok = retry(&signal, 4, Duration::from_millis(1), |_| calls += 1);
        assert!(!ok);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_stops_when_signal_set() {
        let signal = Signal::new();
        let mut seen = Vec::new();
        let ok = retry(&signal, 5, Duration::from_millis(1), |n| {
            seen.push(n);
            if n == 2 {
                signal.set();
            }
        });
        assert!(ok);
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_zero_attempts() {
        let signal = Signal::new();
        assert!(!retry(&signal, 0, Duration::from_millis(1), |_| {
            panic!("no attempt expected")
        }));
        signal.set();
        assert!(retry(&signal, 0, Duration::from_millis(1), |_| {}));
    }

    #[test]
    fn test_unbounded_delay() {
        let signal = Signal::new();
        assert!(retry(&signal, 1, Duration::MAX, |_| signal.set()));
    }
}
