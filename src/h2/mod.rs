//! HTTP/2 client protocol engine
//!
//! A minimal, deterministic HTTP/2 client for probing servers at the frame
//! level. The caller drives everything: the engine sends exactly the frames
//! it is asked to, reports every frame it receives, and surfaces protocol
//! divergence as errors instead of recovering from it.
//!
//! # Architecture
//!
//! - [`codec`]: 9-octet frame header plus payload, buffered streaming decode
//! - [`frames`]: frame types, flags and typed payload views
//! - [`hpack`]: header compression (static table, dynamic tables, Huffman decode)
//! - [`connection`]: preface, SETTINGS exchange, flow control, frame I/O and
//!   the stream-scoped primitives
//! - [`stream`]: per-stream state machine and stream table
//! - [`verify`]: frame assertions for test code and the server quirk policy
//!
//! # Example
//!
//! ```no_run
//! use h2probe::h2::{H2ConnectionBuilder, HeaderList};
//! use h2probe::session::TcpSessionOps;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ops = TcpSessionOps::connect("127.0.0.1:8080".parse()?, Duration::from_secs(5))?;
//! let mut conn = H2ConnectionBuilder::new()
//!     .timeout(Some(Duration::from_secs(5)))
//!     .connect(ops)?;
//!
//! let headers = HeaderList::request("GET", "http", "localhost", "/foo");
//! let stream_id = conn.start_stream(&headers, true)?;
//! let response = conn.receive_response(stream_id)?;
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod headers;
pub mod hpack;
pub mod settings;
pub mod stream;
pub mod verify;

pub use codec::FrameCodec;
pub use connection::{ConnectionState, H2Config, H2Connection, H2ConnectionBuilder, H2Response};
pub use error::{Error, ErrorCode, Result};
pub use frames::{
    ContinuationFrame, DataFrame, Frame, FrameFlags, FrameType, GoawayFrame, HeadersFrame,
    PingFrame, PriorityFrame, PrioritySpec, PushPromiseFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
pub use headers::{HeaderField, HeaderList};
pub use settings::{Settings, SettingsBuilder, SettingsParameter};
pub use stream::{HeaderBlock, HeaderBlockKind, StreamId, StreamState};
pub use verify::{Mismatch, ServerQuirks};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
