#![warn(missing_docs)]

//! saltwire-host: the accepting side of the transport.
//!
//! A [`Listener`] owns the well-known port, answers the server side of the
//! salted handshake, and mints an established [`saltwire_peer::Connection`]
//! on a dedicated port for every client that solves its challenge.

/// The listener and its callback record.
pub mod listener;

pub use listener::{Listener, ListenerCallbacks};
