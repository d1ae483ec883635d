//! The two-variant wire framing and control-frame codec.
//!
//! A datagram's first bit discriminates control traffic (handshake and
//! teardown) from application traffic. Control frames carry a one-byte type
//! id and a fixed payload; application frames carry the session salt, the
//! packet id and whatever the owning channel appends.

use saltwire_core::error::{DecodingErrorKind, ErrorKind, Result};

use crate::bit_io::{BitReader, BitWriter};

/// Derives the shared session salt from the two handshake salts.
///
/// XOR keeps the combiner order-independent, so both sides agree without
/// caring who generated which half.
pub fn combine_salts(client_salt: u64, server_salt: u64) -> u64 {
    client_salt ^ server_salt
}

/// Writes the framing in front of an application payload:
/// discriminator bit, session salt, packet id.
pub fn write_application_header(writer: &mut BitWriter, session_salt: u64, packet_id: u8) {
    writer.write_bool(false);
    writer.write_u64(session_salt);
    writer.write_u8(packet_id);
}

/// Why a peer tore the connection down.
///
/// Unknown codes decode as [`DisconnectReason::Other`]; they are accepted
/// and logged rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer's application asked for the disconnect.
    ClientDisconnect,
    /// The listener had no ports left for a new connection.
    ServerFull,
    /// A live connection already exists for the connecting address.
    ExistingConnection,
    /// The peer saw nothing from us for longer than its idle timeout.
    Timeout,
    /// The listener is shutting down.
    Shutdown,
    /// A code this implementation does not define.
    Other(u8),
}

impl DisconnectReason {
    /// Wire code for this reason.
    pub fn to_u8(self) -> u8 {
        match self {
            DisconnectReason::ClientDisconnect => 1,
            DisconnectReason::ServerFull => 2,
            DisconnectReason::ExistingConnection => 3,
            DisconnectReason::Timeout => 4,
            DisconnectReason::Shutdown => 5,
            DisconnectReason::Other(code) => code,
        }
    }

    /// Decodes a wire code; never fails.
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => DisconnectReason::ClientDisconnect,
            2 => DisconnectReason::ServerFull,
            3 => DisconnectReason::ExistingConnection,
            4 => DisconnectReason::Timeout,
            5 => DisconnectReason::Shutdown,
            other => DisconnectReason::Other(other),
        }
    }
}

/// A decoded control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Client opens a handshake with its random salt.
    Connect {
        /// The client's freshly generated local salt.
        client_salt: u64,
    },
    /// Listener answers a `Connect`, adding its own salt.
    Challenge {
        /// Echo of the client's salt; lets the client reject spoofed
        /// challenges.
        client_salt: u64,
        /// The listener's salt for this exchange.
        server_salt: u64,
    },
    /// Client proves it saw the challenge by combining both salts.
    Solution {
        /// `combine_salts(client_salt, server_salt)`.
        session_salt: u64,
    },
    /// Listener confirms the connection and migrates the flow to a
    /// dedicated port.
    Connected {
        /// The established session salt.
        session_salt: u64,
        /// Server port all further traffic must use.
        port: u16,
    },
    /// Either side tears the connection down.
    Disconnect {
        /// Session salt while connected; the client salt during the
        /// handshake (the session does not exist yet).
        session_salt: u64,
        /// Why the sender is leaving.
        reason: DisconnectReason,
    },
}

const CONTROL_CONNECT: u8 = 1;
const CONTROL_CHALLENGE: u8 = 2;
const CONTROL_SOLUTION: u8 = 3;
const CONTROL_CONNECTED: u8 = 4;
const CONTROL_DISCONNECT: u8 = 5;

impl ControlFrame {
    /// Wire type id of this frame.
    pub fn type_id(&self) -> u8 {
        match self {
            ControlFrame::Connect { .. } => CONTROL_CONNECT,
            ControlFrame::Challenge { .. } => CONTROL_CHALLENGE,
            ControlFrame::Solution { .. } => CONTROL_SOLUTION,
            ControlFrame::Connected { .. } => CONTROL_CONNECTED,
            ControlFrame::Disconnect { .. } => CONTROL_DISCONNECT,
        }
    }

    /// Encodes the frame into a complete datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BitWriter::with_capacity(24);
        writer.write_bool(true);
        writer.write_u8(self.type_id());
        match *self {
            ControlFrame::Connect { client_salt } => {
                writer.write_u64(client_salt);
            }
            ControlFrame::Challenge { client_salt, server_salt } => {
                writer.write_u64(client_salt);
                writer.write_u64(server_salt);
            }
            ControlFrame::Solution { session_salt } => {
                writer.write_u64(session_salt);
            }
            ControlFrame::Connected { session_salt, port } => {
                writer.write_u64(session_salt);
                writer.write_u16(port);
            }
            ControlFrame::Disconnect { session_salt, reason } => {
                writer.write_u64(session_salt);
                writer.write_u8(reason.to_u8());
            }
        }
        writer.finish()
    }

    /// Decodes the frame body; the reader must be positioned just past the
    /// discriminator bit.
    pub fn decode(reader: &mut BitReader<'_>) -> Result<ControlFrame> {
        let type_id = reader.read_u8()?;
        let frame = match type_id {
            CONTROL_CONNECT => ControlFrame::Connect { client_salt: reader.read_u64()? },
            CONTROL_CHALLENGE => ControlFrame::Challenge {
                client_salt: reader.read_u64()?,
                server_salt: reader.read_u64()?,
            },
            CONTROL_SOLUTION => ControlFrame::Solution { session_salt: reader.read_u64()? },
            CONTROL_CONNECTED => ControlFrame::Connected {
                session_salt: reader.read_u64()?,
                port: reader.read_u16()?,
            },
            CONTROL_DISCONNECT => ControlFrame::Disconnect {
                session_salt: reader.read_u64()?,
                reason: DisconnectReason::from_u8(reader.read_u8()?),
            },
            other => {
                return Err(ErrorKind::DecodingError(DecodingErrorKind::ControlType(other)));
            }
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: ControlFrame) -> ControlFrame {
        let bytes = frame.encode();
        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap(), "control frames lead with a set bit");
        ControlFrame::decode(&mut reader).unwrap()
    }

    #[test]
    fn test_connect_roundtrip() {
        let frame = ControlFrame::Connect { client_salt: 0x1122_3344_5566_7788 };
        assert_eq!(roundtrip(frame), frame);
    }

    #[test]
    fn test_challenge_roundtrip() {
        let frame = ControlFrame::Challenge { client_salt: 7, server_salt: u64::MAX };
        assert_eq!(roundtrip(frame), frame);
    }

    #[test]
    fn test_connected_carries_the_assigned_port() {
        let frame = ControlFrame::Connected { session_salt: 42, port: 9001 };
        match roundtrip(frame) {
            ControlFrame::Connected { port, .. } => assert_eq!(port, 9001),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_unknown_disconnect_reason_is_tolerated() {
        let frame = ControlFrame::Disconnect {
            session_salt: 1,
            reason: DisconnectReason::Other(200),
        };
        match roundtrip(frame) {
            ControlFrame::Disconnect { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Other(200));
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_unknown_control_type_is_rejected() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_u8(99);
        let bytes = writer.finish();
        let mut reader = BitReader::new(&bytes);
        reader.read_bool().unwrap();
        assert!(matches!(
            ControlFrame::decode(&mut reader),
            Err(ErrorKind::DecodingError(DecodingErrorKind::ControlType(99)))
        ));
    }

    #[test]
    fn test_truncated_frame_is_an_eof_error() {
        let bytes = ControlFrame::Connect { client_salt: 5 }.encode();
        let mut reader = BitReader::new(&bytes[..bytes.len() - 2]);
        reader.read_bool().unwrap();
        assert!(matches!(
            ControlFrame::decode(&mut reader),
            Err(ErrorKind::DecodingError(DecodingErrorKind::UnexpectedEof))
        ));
    }

    #[test]
    fn test_salt_combiner_is_order_independent() {
        assert_eq!(combine_salts(0xAAAA, 0x5555), combine_salts(0x5555, 0xAAAA));
    }
}
