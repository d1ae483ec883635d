//! Application packet traits consumed from the host.
//!
//! The transport does not prescribe how application packets serialize
//! themselves; it only owns the framed bytes around them. The host supplies
//! a [`PacketFactory`] mapping a one-byte id to a freshly constructed
//! packet, and each packet reads and writes its own body through the
//! bit-level reader/writer pair.

use std::any::Any;

use saltwire_core::error::Result;

use crate::bit_io::{BitReader, BitWriter};

/// A single application packet.
pub trait Packet: Send {
    /// The one-byte type id this packet is registered under.
    fn id(&self) -> u8;

    /// Serializes the packet body after the framing and channel metadata.
    fn write(&self, writer: &mut BitWriter);

    /// Parses the packet body. The reader is positioned past the framing
    /// and channel metadata.
    fn read(&mut self, reader: &mut BitReader<'_>) -> Result<()>;

    /// Upcast for handlers that need the concrete packet type back.
    fn as_any(&self) -> &dyn Any;
}

/// Maps packet type ids to freshly constructed packet instances.
///
/// Exactly one channel is registered per id at any moment; ids run from `0`
/// to `type_count() - 1`.
pub trait PacketFactory: Send + Sync {
    /// Number of distinct packet types the application defines.
    fn type_count(&self) -> u8;

    /// Constructs an empty packet for `id`, or `None` if the id is out of
    /// range.
    fn create(&self, id: u8) -> Option<Box<dyn Packet>>;
}
