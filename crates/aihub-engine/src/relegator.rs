//! Single-slot request/response correlator.
//!
//! A worker thread arms the slot, sends a request and blocks in `wait`; the
//! receive loop hands the next text frame to `fulfil`. Only one arm/wait
//! cycle may be outstanding at a time.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    awaiting: bool,
    response: Option<String>,
}

#[derive(Debug, Default)]
pub struct Relegator {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl Relegator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resets to a fresh, unconsumed waiting state.
    pub fn arm(&self) {
        let mut slot = self.lock();
        slot.awaiting = true;
        slot.response = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().awaiting
    }

    /// Delivers a reply. Returns false when nothing was waiting for one.
    pub fn fulfil(&self, response: String) -> bool {
        let mut slot = self.lock();
        if !slot.awaiting {
            return false;
        }
        slot.awaiting = false;
        slot.response = Some(response);
        self.signal.notify_all();
        true
    }

    /// Blocks until fulfilled or `timeout` elapses; true when fulfilled.
    ///
    /// A timeout disarms the slot so a late reply is routed as a regular
    /// control message instead of being swallowed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        let (mut slot, _) = self
            .signal
            .wait_timeout_while(slot, timeout, |slot| slot.awaiting)
            .unwrap_or_else(PoisonError::into_inner);
        if slot.awaiting {
            slot.awaiting = false;
            return false;
        }
        slot.response.is_some()
    }

    pub fn take_response(&self) -> Option<String> {
        self.lock().response.take()
    }
}
