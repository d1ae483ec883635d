#![warn(missing_docs)]

//! saltwire-core: foundational types shared by every saltwire layer.
//!
//! This crate carries the minimal substrate the protocol, connection and
//! listener crates all sit on:
//! - Protocol constants
//! - Configuration
//! - Error handling
//! - Socket plumbing (datagram trait, bind helper, serialized send pipeline)

/// Protocol constants shared across layers.
pub mod constants {
    /// Hard cap on a single datagram, header included. Anything larger is a
    /// programming error on the sending side and is dropped.
    pub const MAX_DATAGRAM_SIZE: usize = 512;
    /// Number of handshake sends per phase before the attempt is abandoned.
    pub const HANDSHAKE_RETRY_LIMIT: u32 = 10;
    /// Width of the piggybacked acknowledgment vector.
    pub const ACK_VECTOR_BITS: u16 = 32;
    /// Bits of framing in front of an application payload:
    /// discriminator (1) + session salt (64) + packet id (8).
    pub const APPLICATION_HEADER_BITS: u32 = 73;
    /// Bits of reliability metadata on a reliable data frame:
    /// data flag (1) + ack (16) + ack vector (32) + sequence (16).
    pub const RELIABLE_METADATA_BITS: u32 = 65;
}

/// Configuration options to tune protocol and runtime behavior.
pub mod config;
/// Error types and results.
pub mod error;
/// Socket abstraction, bind helper and the serialized send pipeline.
pub mod transport;

pub use config::Config;
pub use error::{DecodingErrorKind, ErrorKind, Result};
pub use transport::{bind_udp, DatagramSocket, LinkConditioner, SendPipeline};
