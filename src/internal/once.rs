//! A cell that only ever accepts its first value.

use crate::error::PipeError;
use parking_lot::Mutex;

/// Holds the terminal error of one half of a pipe.
///
/// The first `set_if_empty` wins; every later call is ignored so that the
/// original close reason survives repeated closes.
#[derive(Default)]
pub(crate) struct OnceError {
    slot: Mutex<Option<PipeError>>,
}

impl OnceError {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `error` unless a value is already present. Returns `true` if this
    /// call stored it.
    pub(crate) fn set_if_empty(&self, error: PipeError) -> bool {
        let mut slot = self.slot.lock();

        if slot.is_some() {
            return false;
        }

        *slot = Some(error);
        true
    }

    pub(crate) fn get(&self) -> Option<PipeError> {
        self.slot.lock().clone()
    }
}
