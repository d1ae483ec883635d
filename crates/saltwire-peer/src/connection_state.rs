//! The atomic connection state cell.

use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle states.
///
/// Transitions are linear on the happy path and always go through the
/// compare-and-set in [`StateCell`]; a transition whose prior state is
/// wrong is a no-op signaling a stale event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Fresh or recovered after a failed handshake; `connect` may run.
    #[default]
    ReadyToConnect = 0,
    /// Client: sent `Connect`, waiting for the listener's `Challenge`.
    AwaitingChallenge = 1,
    /// Client: sent `Solution`, waiting for `Connected`.
    AwaitingConnected = 2,
    /// Handshake complete; application traffic flows.
    Connected = 3,
    /// Terminal.
    Disconnected = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            0 => ConnectionState::ReadyToConnect,
            1 => ConnectionState::AwaitingChallenge,
            2 => ConnectionState::AwaitingConnected,
            3 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// True while the handshake is in flight.
    pub fn is_handshaking(&self) -> bool {
        matches!(self, ConnectionState::AwaitingChallenge | ConnectionState::AwaitingConnected)
    }

    /// True once application traffic may flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True for the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

/// The connection state as a single atomically updated word.
///
/// CAS with an expected prior value is the only way timer-thread and
/// I/O-thread transitions can coordinate without a lock.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Creates a cell in the given state.
    pub fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    /// Current state.
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Attempts `from -> to`; returns whether this call won the transition.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditionally replaces the state, returning the previous one.
    pub fn swap(&self, to: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }

    /// Unconditionally stores a state. Used only to undo a swap that turned
    /// out to be a no-op (disconnect while still `ReadyToConnect`).
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_requires_expected_prior_state() {
        let cell = StateCell::new(ConnectionState::ReadyToConnect);
        assert!(cell.transition(ConnectionState::ReadyToConnect, ConnectionState::AwaitingChallenge));
        // Stale event: the prior state moved on.
        assert!(!cell.transition(ConnectionState::ReadyToConnect, ConnectionState::AwaitingChallenge));
        assert_eq!(cell.load(), ConnectionState::AwaitingChallenge);
    }

    #[test]
    fn test_swap_reports_previous_state() {
        let cell = StateCell::new(ConnectionState::Connected);
        assert_eq!(cell.swap(ConnectionState::Disconnected), ConnectionState::Connected);
        assert!(cell.load().is_terminal());
    }
}
