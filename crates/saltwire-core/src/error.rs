//! Error types and results.

use std::{fmt, io};

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors that can occur in the transport.
///
/// Protocol violations coming off the wire never surface here; they are
/// logged and dropped. `ErrorKind` is returned only from direct API calls.
#[derive(Debug)]
pub enum ErrorKind {
    /// Wrapper around a `std::io::Error`.
    IOError(io::Error),
    /// A datagram or control frame could not be decoded.
    DecodingError(DecodingErrorKind),
    /// The operation requires an established connection.
    NotConnected,
    /// The packet id is outside the factory's type range.
    UnknownPacketId(u8),
    /// A framed datagram exceeded the datagram size cap.
    OversizeDatagram(usize),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IOError(e) => write!(f, "an IO error occurred: {}", e),
            ErrorKind::DecodingError(e) => write!(f, "could not decode datagram: {}", e),
            ErrorKind::NotConnected => write!(f, "the connection is not established"),
            ErrorKind::UnknownPacketId(id) => {
                write!(f, "packet id {} is not known to the packet factory", id)
            }
            ErrorKind::OversizeDatagram(len) => {
                write!(f, "framed datagram of {} bytes exceeds the datagram cap", len)
            }
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IOError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(inner: io::Error) -> Self {
        ErrorKind::IOError(inner)
    }
}

/// Ways in which decoding the framed bytes can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The datagram ended before the expected field did.
    UnexpectedEof,
    /// The control type id is not one of the known control frames.
    ControlType(u8),
    /// The application packet body failed to parse.
    PacketPayload,
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::UnexpectedEof => write!(f, "unexpected end of datagram"),
            DecodingErrorKind::ControlType(id) => write!(f, "unknown control type {}", id),
            DecodingErrorKind::PacketPayload => write!(f, "malformed packet payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: ErrorKind = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, ErrorKind::IOError(_)));
    }

    #[test]
    fn test_display_names_the_control_type() {
        let err = ErrorKind::DecodingError(DecodingErrorKind::ControlType(9));
        assert!(err.to_string().contains('9'));
    }
}
