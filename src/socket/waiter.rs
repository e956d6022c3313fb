//! Single-slot suspended-caller handle.
//!
//! A waiter holds at most one pending caller. The event that satisfies the
//! caller (data, a completed handshake, socket closure) resolves it exactly
//! once. A caller that gave up (its future was dropped, e.g. on timeout)
//! leaves a closed sender behind, which counts as an empty slot.

use crate::error::{NetError, Result};
use tokio::sync::oneshot;

#[derive(Debug)]
pub(crate) struct Waiter<T> {
    slot: Option<oneshot::Sender<T>>,
}

impl<T> Default for Waiter<T> {
    fn default() -> Self {
        Waiter { slot: None }
    }
}

impl<T> Waiter<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register the caller. Fails fast if a live caller already waits.
    pub(crate) fn arm(&mut self) -> Result<oneshot::Receiver<T>> {
        if self.is_armed() {
            return Err(NetError::ReceivePending);
        }
        let (tx, rx) = oneshot::channel();
        self.slot = Some(tx);
        Ok(rx)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.slot.as_ref().map_or(false, |tx| !tx.is_closed())
    }

    /// Resolve the pending caller, handing `value` back if nobody is listening.
    pub(crate) fn wake(&mut self, value: T) -> std::result::Result<(), T> {
        match self.slot.take() {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }
}
