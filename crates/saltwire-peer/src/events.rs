//! Connect status and the application callback record.

use std::sync::Arc;

use saltwire_protocol::Packet;

/// Outcome of a connect attempt, handed to the `on_connected` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The four-way handshake completed.
    Success,
    /// The retry budget ran out waiting for a `Challenge`.
    NoChallengeReceived,
    /// The retry budget ran out waiting for `Connected`.
    NoConnectedReceived,
    /// The peer refused or tore the attempt down mid-handshake.
    Disconnect,
}

/// Application-supplied capability set a connection invokes.
///
/// This replaces inheritance hooks with an explicit record of function
/// values passed at construction. Every field defaults to a no-op so
/// listener-minted connections can be configured inside the
/// `on_connection` hook before their receive pump starts.
#[derive(Clone)]
pub struct ConnectionCallbacks {
    /// Invoked once per connect attempt with its outcome.
    pub on_connected: Arc<dyn Fn(ConnectStatus) + Send + Sync>,
    /// Invoked at most once per connection lifetime, when an established
    /// connection goes down.
    pub on_disconnect: Arc<dyn Fn() + Send + Sync>,
    /// Invoked for every application packet a channel delivers upward.
    pub on_packet: Arc<dyn Fn(Box<dyn Packet>) + Send + Sync>,
}

impl Default for ConnectionCallbacks {
    fn default() -> Self {
        ConnectionCallbacks {
            on_connected: Arc::new(|_| {}),
            on_disconnect: Arc::new(|| {}),
            on_packet: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCallbacks").finish_non_exhaustive()
    }
}
