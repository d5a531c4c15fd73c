//! Timed rendezvous between the CDM callback thread and API callers.
//!
//! An [`Event`] is a latched flag paired with a condition variable. A signal
//! that arrives before anyone waits stays latched, so the next [`Event::wait`]
//! returns immediately instead of sleeping through the whole timeout.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Latched, auto-resetting wait/signal primitive.
#[derive(Debug, Default)]
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the event and wake every waiter.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        *signalled = true;
        self.cond.notify_all();
    }

    /// Block until signalled or `timeout` elapses.
    ///
    /// `Duration::ZERO` waits forever. The latch is consumed on a successful
    /// return. Returns `false` only when the timeout expired unsignalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);

        let mut guard = if timeout.is_zero() {
            self.cond
                .wait_while(guard, |signalled| !*signalled)
                .unwrap_or_else(PoisonError::into_inner)
        } else {
            let (guard, _) = self
                .cond
                .wait_timeout_while(guard, timeout, |signalled| !*signalled)
                .unwrap_or_else(PoisonError::into_inner);
            guard
        };

        if !*guard {
            return false;
        }
        *guard = false;
        true
    }

    /// Drop a pending latch without waiting.
    pub fn reset(&self) {
        *self.signalled.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::Event;
    use std::time::Duration;

    #[test]
    fn early_signal_is_not_lost() {
        let event = Event::new();
        event.signal();

        let start = Instant::now();
        assert!(event.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_consumes_latch() {
        let event = Event::new();
        event.signal();
        assert!(event.wait(Duration::from_millis(10)));
        assert!(!event.wait(Duration::from_millis(20)));
    }

    #[test]
    fn wait_times_out() {
        let event = Event::new();
        let start = Instant::now();
        assert!(!event.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn zero_timeout_blocks_until_signal() {
        let event = Arc::new(Event::new());
        let signaller = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                event.signal();
            })
        };

        assert!(event.wait(Duration::ZERO));
        signaller.join().expect("signaller thread");
    }

    #[test]
    fn reset_clears_pending_signal() {
        let event = Event::new();
        event.signal();
        event.reset();
        assert!(!event.wait(Duration::from_millis(10)));
    }
}
