//! Win32-style events on top of a mutex and condvar.
//!
//! Feeders, the renderer's flush protocol, and the endpoint wake signal all
//! speak in terms of set/reset events with optional timeouts. A
//! manual-reset event stays signalled until reset (the flush event); an
//! auto-reset event releases one waiter and clears itself (worker wakes).

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A settable, waitable event.
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    /// An event that stays signalled until explicitly reset.
    pub fn manual_reset() -> Event {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
            manual_reset: true,
        }
    }

    /// An event that clears itself after releasing one waiter.
    pub fn auto_reset() -> Event {
        Event {
            state: Mutex::new(false),
            cond: Condvar::new(),
            manual_reset: false,
        }
    }

    /// Signal the event, waking waiters.
    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Clear the event.
    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    /// Whether the event is currently signalled, without consuming it.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Block until the event is signalled.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
        if !self.manual_reset {
            *state = false;
        }
    }

    /// Block until the event is signalled or `timeout` elapses. Returns
    /// whether the event was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
        if !self.manual_reset {
            *state = false;
        }
        true
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::auto_reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_before_wait() {
        let event = Event::auto_reset();
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(1)));
        // Auto-reset consumed the signal.
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_manual_reset_stays_signalled() {
        let event = Event::manual_reset();
        event.set();
        assert!(event.wait_timeout(Duration::from_millis(1)));
        assert!(event.wait_timeout(Duration::from_millis(1)));
        event.reset();
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let event = Arc::new(Event::auto_reset());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        event.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_timeout_expires() {
        let event = Event::auto_reset();
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
