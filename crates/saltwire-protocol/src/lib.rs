#![warn(missing_docs)]

//! saltwire-protocol: wire framing, control frames and delivery channels.

/// Ack bookkeeping for reliable channels.
pub mod acknowledgment;
/// Bit-level reader/writer over a byte buffer.
pub mod bit_io;
/// The channel abstraction and its three reliability variants.
pub mod channel;
/// Application packet traits consumed from the host.
pub mod packet;
/// Sequence arithmetic and the receive window.
pub mod sequence_buffer;
/// The two-variant wire framing and control-frame codec.
pub mod wire;

pub use acknowledgment::AckState;
pub use bit_io::{BitReader, BitWriter};
pub use channel::{create_channel, Channel, ChannelIo, ChannelKind};
pub use packet::{Packet, PacketFactory};
pub use sequence_buffer::{
    sequence_greater_than, sequence_less_than, ReceiveWindow, SequenceNumber,
};
pub use wire::{combine_salts, ControlFrame, DisconnectReason};
