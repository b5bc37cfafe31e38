//! Engine errors, plus the numeric codes carried by RST_STREAM and GOAWAY
//! (RFC 7540 Section 7)

use super::stream::StreamState;
use crate::session;
use std::fmt;

/// HTTP/2 engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure that is neither a timeout nor a close
    #[error("Session error: {0}")]
    Session(String),

    /// Malformed frame header, bad length, or truncated frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// Frame could not be encoded (e.g. payload exceeds max frame size)
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Malformed or out-of-range header block encoding
    #[error("Compression error: {0}")]
    Compression(String),

    /// Protocol violation (interrupted header block, illegal transition, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A DATA frame would drive a flow-control window negative
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Flow-control window exhausted part way through a body.
    /// `sent` bytes were written; retry with the remainder after a WINDOW_UPDATE.
    #[error("Would block: stream {stream_id} window exhausted after {sent} bytes")]
    WouldBlock { stream_id: u32, sent: usize },

    /// Operation on (or frame for) a stream that is already closed
    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    /// Operation not permitted in the stream's current state
    #[error("Invalid stream state: stream {stream_id} is {state:?}")]
    InvalidStreamState { stream_id: u32, state: StreamState },

    /// The peer reset a stream while the caller was waiting on it
    #[error("Stream {stream_id} reset by peer: {error_code}")]
    StreamReset { stream_id: u32, error_code: ErrorCode },

    /// A frame arrived that cannot satisfy the pending operation
    #[error("Unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame { expected: String, got: String },

    /// Transport closed or GOAWAY received
    #[error("Connection closed")]
    ConnectionClosed,

    /// Caller-supplied deadline exceeded
    #[error("Timeout")]
    Timeout,

    /// Preface / SETTINGS exchange failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// Too many streams
    #[error("Too many concurrent streams")]
    TooManyStreams,

    /// ALPN negotiation failed
    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<Vec<u8>>),
}

impl Error {
    /// True for the recoverable flow-control signals
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock { .. } | Error::FlowControl(_))
    }

    /// True if the caller's deadline expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True if the connection can no longer be used
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}

impl From<session::Error> for Error {
    fn from(err: session::Error) -> Self {
        match err {
            session::Error::Io(e) => Error::Io(e),
            session::Error::Timeout => Error::Timeout,
            session::Error::ConnectionClosed => Error::ConnectionClosed,
            session::Error::AlpnFailed(proto) => Error::AlpnFailed(proto),
            other => Error::Session(other.to_string()),
        }
    }
}

/// HTTP/2 error code as carried on the wire.
///
/// The protocol defines codes 0x0-0xd, but any 32-bit value is legal and
/// is preserved verbatim, so a test can assert on e.g. `ErrorCode(1111)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// Graceful shutdown
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    /// Protocol error detected
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    /// Implementation fault
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    /// Flow-control limits exceeded
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    /// Settings not acknowledged
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    /// Frame received for closed stream
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    /// Frame size incorrect
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    /// Stream not processed
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    /// Stream cancelled
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    /// Compression state not updated
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    /// TCP connection error for CONNECT method
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    /// Processing capacity exceeded
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    /// Negotiated TLS parameters not acceptable
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    /// Use HTTP/1.1 for the request
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Self {
        ErrorCode(code)
    }

    /// Registered name, if the code is one the protocol defines
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:x})", name, self.0),
            None => write!(f, "UNKNOWN (0x{:x})", self.0),
        }
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NO_ERROR.as_u32(), 0x0);
        assert_eq!(ErrorCode::PROTOCOL_ERROR.as_u32(), 0x1);
        assert_eq!(ErrorCode::HTTP_1_1_REQUIRED.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x8), ErrorCode::CANCEL);
        assert_eq!(ErrorCode::from(1111).as_u32(), 1111);
    }

    #[test]
    fn test_error_code_name() {
        assert_eq!(ErrorCode::NO_ERROR.name(), Some("NO_ERROR"));
        assert_eq!(ErrorCode::FLOW_CONTROL_ERROR.name(), Some("FLOW_CONTROL_ERROR"));
        assert_eq!(ErrorCode(1111).name(), None);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::INTERNAL_ERROR.to_string(), "INTERNAL_ERROR (0x2)");
        assert_eq!(ErrorCode(1111).to_string(), "UNKNOWN (0x457)");
    }

    #[test]
    fn test_error_messages_name_the_stream() {
        let reset = Error::StreamReset { stream_id: 5, error_code: ErrorCode(1111) };
        assert_eq!(reset.to_string(), "Stream 5 reset by peer: UNKNOWN (0x457)");

        let blocked = Error::WouldBlock { stream_id: 3, sent: 100 };
        assert_eq!(
            blocked.to_string(),
            "Would block: stream 3 window exhausted after 100 bytes"
        );
    }

    #[test]
    fn test_session_error_keeps_timeout_distinct() {
        assert!(Error::from(session::Error::Timeout).is_timeout());
        assert!(Error::from(session::Error::ConnectionClosed).is_connection_closed());
        assert!(Error::WouldBlock { stream_id: 1, sent: 0 }.is_would_block());
    }
}
