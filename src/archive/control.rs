//! Activation control for the archiver's background threads.
//!
//! A background thread parks in [`ArchiverControl::wait_for_activation`]
//! until an orchestrating thread calls [`ArchiverControl::activate`] with an
//! end LSN. The controller never interprets the LSN; it only guarantees it
//! never decreases across activations. The wait wakes every 100 ms to poll
//! the shared shutdown flag, so a shutdown is observed even when no
//! activation ever arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::lsn::Lsn;

const WAIT_TICK: Duration = Duration::from_millis(100);

pub struct ArchiverControl {
    state: Mutex<ControlState>,
    activate_cond: Condvar,
    shutdown_flag: Arc<AtomicBool>,
}

#[derive(Default)]
struct ControlState {
    end_lsn: Lsn,
    activated: bool,
    listening: bool,
}

impl ArchiverControl {
    pub fn new(shutdown_flag: Arc<AtomicBool>) -> Self {
        Self {
            state: Mutex::new(ControlState::default()),
            activate_cond: Condvar::new(),
            shutdown_flag,
        }
    }

    /// Wakes the background thread to work up to `lsn`. With `wait`, blocks
    /// for the state mutex; otherwise gives up when the thread holds it
    /// (i.e. is already working). The end LSN never decreases.
    pub fn activate(&self, wait: bool, lsn: Lsn) -> bool {
        let mut state = if wait {
            self.state.lock().unwrap()
        } else {
            match self.state.try_lock() {
                Ok(state) => state,
                Err(_) => return false,
            }
        };
        if lsn > state.end_lsn {
            state.end_lsn = lsn;
        }
        state.activated = true;
        drop(state);
        self.activate_cond.notify_one();
        true
    }

    /// Parks until activated. Returns the end LSN to work towards, or None
    /// when the shutdown flag was raised. The activated state is cleared by
    /// [`ArchiverControl::work_done`] once the cycle completes.
    pub fn wait_for_activation(&self) -> Option<Lsn> {
        let mut state = self.state.lock().unwrap();
        state.listening = true;
        while !state.activated {
            let (next, timeout) = self
                .activate_cond
                .wait_timeout(state, WAIT_TICK)
                .unwrap();
            state = next;
            if timeout.timed_out() && self.shutdown_flag.load(Ordering::Acquire) {
                state.listening = false;
                return None;
            }
        }
        state.listening = false;
        Some(state.end_lsn)
    }

    /// Clears the activated flag after a work cycle.
    pub fn work_done(&self) {
        self.state.lock().unwrap().activated = false;
    }

    pub fn end_lsn(&self) -> Lsn {
        self.state.lock().unwrap().end_lsn
    }

    /// Raises the end LSN from within the working thread (the consumer can
    /// overshoot the requested LSN when it crosses a partition boundary).
    pub fn advance_end_lsn(&self, lsn: Lsn) {
        let mut state = self.state.lock().unwrap();
        if lsn > state.end_lsn {
            state.end_lsn = lsn;
        }
    }

    pub fn is_activated(&self) -> bool {
        self.state.lock().unwrap().activated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn activation_delivers_end_lsn() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = Arc::new(ArchiverControl::new(shutdown));
        let control2 = control.clone();
        let handle = thread::spawn(move || control2.wait_for_activation());
        // Give the waiter a moment to park; activation is still delivered
        // even if it arrives first, because the flag persists.
        control.activate(true, Lsn::new(1, 4096));
        assert_eq!(handle.join().unwrap(), Some(Lsn::new(1, 4096)));
    }

    #[test]
    fn end_lsn_never_decreases() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = ArchiverControl::new(shutdown);
        control.activate(true, Lsn::new(2, 100));
        control.activate(true, Lsn::new(1, 500));
        assert_eq!(control.end_lsn(), Lsn::new(2, 100));
    }

    #[test]
    fn shutdown_interrupts_the_wait() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = Arc::new(ArchiverControl::new(shutdown.clone()));
        let control2 = control.clone();
        let handle = thread::spawn(move || control2.wait_for_activation());
        thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::Release);
        // The next 100 ms tick observes the flag.
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn activation_with_same_lsn_is_a_no_op_window() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let control = ArchiverControl::new(shutdown);
        control.activate(true, Lsn::new(1, 100));
        control.work_done();
        // Re-activating with the same LSN wakes the thread but leaves the
        // window empty; the archiver loop detects that and goes back to
        // sleep.
        control.activate(true, Lsn::new(1, 100));
        assert_eq!(control.end_lsn(), Lsn::new(1, 100));
        assert!(control.is_activated());
    }
}
