#![warn(missing_docs)]

//! Saltwire: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types to build connections over the salted-handshake
//! transport:
//!
//! - Client side: [`Connection`], [`ConnectionCallbacks`], [`ConnectStatus`]
//! - Server side: [`Listener`], [`ListenerCallbacks`]
//! - Application packets: [`Packet`], [`PacketFactory`], [`BitReader`],
//!   [`BitWriter`]
//! - Delivery policies: [`ChannelKind`]
//! - Core configuration: [`Config`]
//!
//! Example
//! ```ignore
//! use std::sync::Arc;
//! use saltwire::prelude::*;
//!
//! let listener = Listener::new(9000, 4, factory.clone(), Config::default(), hooks);
//! listener.start()?;
//!
//! let connection = Connection::new(factory, Config::default(), callbacks);
//! connection.set_packet_channel(0, ChannelKind::OrderedReliable)?;
//! connection.connect("127.0.0.1:9000".parse()?)?;
//! ```

// Core config and errors
pub use saltwire_core::{Config, DecodingErrorKind, ErrorKind, Result};
// Host: the accepting listener
pub use saltwire_host::{Listener, ListenerCallbacks};
// Peer: the per-connection entity
pub use saltwire_peer::{
    ConnectStatus, Connection, ConnectionCallbacks, ConnectionState, ConnectionStats,
};
// Protocol: packets, channels and framing primitives
pub use saltwire_protocol::{
    BitReader, BitWriter, ChannelKind, DisconnectReason, Packet, PacketFactory,
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        BitReader, BitWriter, ChannelKind, Config, ConnectStatus, Connection,
        ConnectionCallbacks, ConnectionState, Listener, ListenerCallbacks, Packet,
        PacketFactory,
    };
}
