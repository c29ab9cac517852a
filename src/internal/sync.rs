//! Synchronization primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;

/// A one-shot broadcast flag.
///
/// Once fired it stays fired. Threads waiting on the pipe monitor re-check it
/// under the monitor lock, so firing followed by a notify under that same lock
/// cannot be missed.
#[derive(Default)]
pub(crate) struct Signal {
    fired: AtomicBool,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub(crate) fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Tasks parked on one side of the pipe.
#[derive(Default)]
pub(crate) struct WakerSet {
    wakers: Vec<Waker>,
}

impl WakerSet {
    /// Remember `waker`, unless an equivalent one is already registered.
    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}
