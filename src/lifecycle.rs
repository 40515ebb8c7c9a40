//! Store lifecycle: `Created → Running → Closing → Closed`.
//!
//! The state is shared between the facade (which moves it forward) and the
//! writer thread (which stops soliciting work once it leaves `Running`).
//! There is no way back to `Running`.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where a store is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreState {
    /// Connections are being opened; the writer isn't running yet.
    Created = 0,
    /// Accepting `initialize`, `persist` and `events`.
    Running = 1,
    /// `close` was called; the writer drains its backlog.
    Closing = 2,
    /// Writer stopped, connections released.
    Closed = 3,
}

impl StoreState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => StoreState::Created,
            1 => StoreState::Running,
            2 => StoreState::Closing,
            _ => StoreState::Closed,
        }
    }
}

/// Atomic holder for a [`StoreState`].
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(StoreState::Created as u8),
        }
    }

    pub(crate) fn state(&self) -> StoreState {
        StoreState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == StoreState::Running
    }

    /// Moves `from → to` if the current state is `from`.
    ///
    /// Returns false (and changes nothing) otherwise, so concurrent callers
    /// of `close` agree on exactly one winner.
    pub(crate) fn transition(&self, from: StoreState, to: StoreState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set(&self, to: StoreState) {
        self.state.store(to as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), StoreState::Created);
        assert!(!lifecycle.is_running());

        assert!(lifecycle.transition(StoreState::Created, StoreState::Running));
        assert!(lifecycle.is_running());

        assert!(lifecycle.transition(StoreState::Running, StoreState::Closing));
        // A second closer loses the race
        assert!(!lifecycle.transition(StoreState::Running, StoreState::Closing));

        lifecycle.set(StoreState::Closed);
        assert_eq!(lifecycle.state(), StoreState::Closed);
        assert!(!lifecycle.transition(StoreState::Created, StoreState::Running));
    }
}
