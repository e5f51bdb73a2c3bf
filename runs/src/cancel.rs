//! Cooperative cancellation.
//!
//! Runs are never torn down preemptively. The owner sets a shared flag and
//! the run observes it at its own safe points, so cleanup on cancellation is
//! the thread unwinding normally from a place it chose.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

struct CancelShared {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Cloneable cancellation flag shared between a run and its owner.
///
/// All clones observe the same flag; once set it never clears.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CancelShared {
                cancelled: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request cancellation and wake every waiter blocked in
    /// [`wait_timeout`](Self::wait_timeout).
    pub fn cancel(&self) {
        let mut cancelled = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        drop(cancelled);
        self.shared.condvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until `dur` elapses or the token is cancelled, whichever comes
    /// first. Returns whether cancellation was observed.
    ///
    /// This is the safe-point primitive: loop bodies use it in place of a
    /// bare sleep so a cancel request wakes them immediately.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let cancelled = self
            .shared
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (cancelled, _timed_out) = self
            .shared
            .condvar
            .wait_timeout_while(cancelled, dur, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
