#![warn(missing_docs)]

//! saltwire-peer: the per-peer connection entity.
//!
//! A [`Connection`] owns a UDP socket, the peer's endpoint, the handshake
//! salts, a table of delivery channels, a serialized send pipeline and the
//! timer that drives retransmission and liveness. Both public surfaces of
//! the transport use it: the connecting client drives the four-way
//! handshake through [`Connection::connect`], and the accepting listener
//! mints already-established connections via [`Connection::accept`].

/// The connection entity and its send/receive machinery.
pub mod connection;
/// The atomic connection state cell.
pub mod connection_state;
/// Connect status and the application callback record.
pub mod events;

pub use connection::{Connection, ConnectionStats};
pub use connection_state::ConnectionState;
pub use events::{ConnectStatus, ConnectionCallbacks};
