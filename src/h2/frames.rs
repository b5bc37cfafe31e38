//! Frame model (RFC 7540 Section 4, 6)
//!
//! [`Frame`] is the raw wire unit; the typed structs are views that parse
//! from a `Frame` and build one back.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame type octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    /// Any type this engine does not interpret; passed through as is
    Unknown(u8),
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::Goaway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(byte) => byte,
        }
    }

    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x0 => FrameType::Data,
            0x1 => FrameType::Headers,
            0x2 => FrameType::Priority,
            0x3 => FrameType::RstStream,
            0x4 => FrameType::Settings,
            0x5 => FrameType::PushPromise,
            0x6 => FrameType::Ping,
            0x7 => FrameType::Goaway,
            0x8 => FrameType::WindowUpdate,
            0x9 => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }

    /// Upper-case name as written in RFC 7540
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }

    /// Flags that carry meaning for this frame type.
    ///
    /// Everything else is ignored on read and zeroed on write. Unknown types
    /// keep all their flag bits.
    pub fn defined_flags(&self) -> u8 {
        match self {
            FrameType::Data => FrameFlags::END_STREAM | FrameFlags::PADDED,
            FrameType::Headers => {
                FrameFlags::END_STREAM
                    | FrameFlags::END_HEADERS
                    | FrameFlags::PADDED
                    | FrameFlags::PRIORITY
            }
            FrameType::PushPromise => FrameFlags::END_HEADERS | FrameFlags::PADDED,
            FrameType::Continuation => FrameFlags::END_HEADERS,
            FrameType::Settings | FrameType::Ping => FrameFlags::ACK,
            FrameType::Priority
            | FrameType::RstStream
            | FrameType::Goaway
            | FrameType::WindowUpdate => 0,
            FrameType::Unknown(_) => 0xFF,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// Raw flags octet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Set a flag when `cond` holds
    pub fn set_if(&mut self, flag: u8, cond: bool) {
        if cond {
            self.set(flag);
        }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// Keep only the bits in `mask`
    pub fn masked(self, mask: u8) -> Self {
        FrameFlags(self.0 & mask)
    }

    pub const END_STREAM: u8 = 0x1;
    /// Shares bit 0x1 with END_STREAM; only SETTINGS and PING use it
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// One frame as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// END_STREAM on a DATA or HEADERS frame
    pub fn is_end_stream(&self) -> bool {
        matches!(self.frame_type, FrameType::Data | FrameType::Headers) && self.flags.is_end_stream()
    }

    /// END_HEADERS on a HEADERS, PUSH_PROMISE or CONTINUATION frame
    pub fn is_end_headers(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::Headers | FrameType::PushPromise | FrameType::Continuation
        ) && self.flags.is_end_headers()
    }

    /// ACK on a SETTINGS or PING frame
    pub fn is_ack(&self) -> bool {
        matches!(self.frame_type, FrameType::Settings | FrameType::Ping) && self.flags.is_ack()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} flags=0x{:02x} len={}",
            self.frame_type.name(),
            self.stream_id,
            self.flags.as_u8(),
            self.payload.len()
        )
    }
}

fn expect_type(frame: &Frame, expected: FrameType) -> Result<()> {
    if frame.frame_type != expected {
        return Err(Error::Framing(format!(
            "Expected {} frame, got {}",
            expected.name(),
            frame.frame_type.name()
        )));
    }
    Ok(())
}

fn expect_len(frame: &Frame, len: usize) -> Result<()> {
    if frame.payload.len() != len {
        return Err(Error::Framing(format!(
            "{} payload must be {} bytes, got {}",
            frame.frame_type.name(),
            len,
            frame.payload.len()
        )));
    }
    Ok(())
}

/// Split off the PADDED prefix and suffix, returning (body, pad length)
fn strip_padding(frame: &Frame) -> Result<(Bytes, Option<u8>)> {
    if !frame.flags.is_padded() {
        return Ok((frame.payload.clone(), None));
    }
    if frame.payload.is_empty() {
        return Err(Error::Framing(format!(
            "PADDED {} frame without pad length",
            frame.frame_type.name()
        )));
    }
    let pad_len = frame.payload[0];
    let body_len = frame.payload.len() - 1;
    if pad_len as usize > body_len {
        return Err(Error::Framing(format!(
            "Pad length {} exceeds {} payload",
            pad_len,
            frame.frame_type.name()
        )));
    }
    let body = frame.payload.slice(1..frame.payload.len() - pad_len as usize);
    Ok((body, Some(pad_len)))
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// DATA (Section 6.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Pad length; `Some` sets PADDED
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Get total frame size including padding (the flow-controlled length)
    pub fn frame_size(&self) -> usize {
        let mut size = self.data.len();
        if let Some(pad_len) = self.padding {
            size += 1 + pad_len as usize; // 1 byte for pad length field + padding
        }
        size
    }

    /// Build the wire frame
    pub fn to_frame(&self) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, self.end_stream);

        let mut buf = BytesMut::with_capacity(self.frame_size());
        if let Some(pad_len) = self.padding {
            flags.set(FrameFlags::PADDED);
            buf.put_u8(pad_len);
            buf.put_slice(&self.data);
            buf.put_bytes(0, pad_len as usize);
        } else {
            buf.put_slice(&self.data);
        }

        Frame::new(FrameType::Data, flags, self.stream_id, buf.freeze())
    }
}

impl TryFrom<&Frame> for DataFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Data)?;
        let (data, padding) = strip_padding(frame)?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            data,
            end_stream: frame.flags.is_end_stream(),
            padding,
        })
    }
}

/// HEADERS (Section 6.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    /// `Some` sets the PRIORITY flag
    pub priority: Option<PrioritySpec>,
    /// Pad length; `Some` sets PADDED
    pub padding: Option<u8>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
            padding: None,
        }
    }

    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Build the wire frame
    pub fn to_frame(&self) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, self.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, self.end_headers);

        let mut buf = BytesMut::new();
        if let Some(pad_len) = self.padding {
            flags.set(FrameFlags::PADDED);
            buf.put_u8(pad_len);
        }
        if let Some(priority) = &self.priority {
            flags.set(FrameFlags::PRIORITY);
            priority.encode(&mut buf);
        }
        buf.put_slice(&self.header_block);
        if let Some(pad_len) = self.padding {
            buf.put_bytes(0, pad_len as usize);
        }

        Frame::new(FrameType::Headers, flags, self.stream_id, buf.freeze())
    }
}

impl TryFrom<&Frame> for HeadersFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Headers)?;
        let (mut block, padding) = strip_padding(frame)?;

        let priority = if frame.flags.is_priority() {
            if block.len() < 5 {
                return Err(Error::Framing(
                    "HEADERS with PRIORITY flag shorter than 5 bytes".to_string(),
                ));
            }
            let spec = PrioritySpec::decode(&block[..5]);
            block = block.slice(5..);
            Some(spec)
        } else {
            None
        };

        Ok(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: block,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
            padding,
        })
    }
}

/// Dependency, exclusivity and weight (RFC 7540 Section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: u32,
    pub exclusive: bool,
    /// Weight as sent on the wire (effective weight minus one)
    pub weight: u8,
}

impl PrioritySpec {
    pub fn new(stream_dependency: u32, exclusive: bool, weight: u8) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut dep = self.stream_dependency & 0x7FFFFFFF;
        if self.exclusive {
            dep |= 0x80000000; // Set exclusive bit
        }
        buf.put_u32(dep);
        buf.put_u8(self.weight);
    }

    fn decode(bytes: &[u8]) -> Self {
        let raw = u32_at(bytes, 0);
        PrioritySpec {
            stream_dependency: raw & 0x7FFFFFFF,
            exclusive: raw & 0x80000000 != 0,
            weight: bytes[4],
        }
    }
}

/// PRIORITY (Section 6.3), deprecated but still sent by test clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub priority: PrioritySpec,
}

impl PriorityFrame {
    /// Build the wire frame
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(5);
        self.priority.encode(&mut buf);
        Frame::new(FrameType::Priority, FrameFlags::empty(), self.stream_id, buf.freeze())
    }
}

impl TryFrom<&Frame> for PriorityFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Priority)?;
        expect_len(frame, 5)?;
        Ok(PriorityFrame {
            stream_id: frame.stream_id,
            priority: PrioritySpec::decode(&frame.payload),
        })
    }
}

/// RST_STREAM (Section 6.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        RstStreamFrame {
            stream_id,
            error_code,
        }
    }

    /// Build the wire frame
    pub fn to_frame(&self) -> Frame {
        let payload = Bytes::copy_from_slice(&self.error_code.as_u32().to_be_bytes());
        Frame::new(FrameType::RstStream, FrameFlags::empty(), self.stream_id, payload)
    }
}

impl TryFrom<&Frame> for RstStreamFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::RstStream)?;
        expect_len(frame, 4)?;
        Ok(RstStreamFrame {
            stream_id: frame.stream_id,
            error_code: ErrorCode(u32_at(&frame.payload, 0)),
        })
    }
}

/// SETTINGS (Section 6.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Empty SETTINGS with ACK set
    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }

    /// Build the wire frame (stream ID must be 0 for SETTINGS)
    pub fn to_frame(&self) -> Frame {
        if self.ack {
            return Frame::new(
                FrameType::Settings,
                FrameFlags::from_u8(FrameFlags::ACK),
                0,
                Bytes::new(),
            );
        }
        Frame::new(FrameType::Settings, FrameFlags::empty(), 0, self.settings.encode())
    }
}

impl TryFrom<&Frame> for SettingsFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Settings)?;
        if frame.stream_id != 0 {
            return Err(Error::Protocol(
                "SETTINGS frame must have stream ID 0".to_string(),
            ));
        }
        if frame.flags.is_ack() {
            if !frame.payload.is_empty() {
                return Err(Error::Framing("SETTINGS ACK with a payload".to_string()));
            }
            return Ok(SettingsFrame::ack());
        }
        Ok(SettingsFrame::new(Settings::decode(&frame.payload)?))
    }
}

/// PUSH_PROMISE (Section 6.6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPromiseFrame {
    pub stream_id: u32,
    /// Stream reserved by the push
    pub promised_stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
    /// Pad length; `Some` sets PADDED
    pub padding: Option<u8>,
}

impl TryFrom<&Frame> for PushPromiseFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::PushPromise)?;
        let (body, padding) = strip_padding(frame)?;
        if body.len() < 4 {
            return Err(Error::Framing(
                "PUSH_PROMISE shorter than promised stream ID".to_string(),
            ));
        }
        Ok(PushPromiseFrame {
            stream_id: frame.stream_id,
            promised_stream_id: u32_at(&body, 0) & 0x7FFFFFFF,
            header_block: body.slice(4..),
            end_headers: frame.flags.is_end_headers(),
            padding,
        })
    }
}

/// PING (Section 6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// Echo `data` back with ACK set
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    /// Build the wire frame (stream ID 0, payload always 8 bytes)
    pub fn to_frame(&self) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, self.ack);
        Frame::new(FrameType::Ping, flags, 0, Bytes::copy_from_slice(&self.data))
    }
}

impl TryFrom<&Frame> for PingFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Ping)?;
        expect_len(frame, 8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload);
        Ok(PingFrame {
            ack: frame.flags.is_ack(),
            data,
        })
    }
}

/// GOAWAY (Section 6.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Highest stream id the sender may have processed
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    /// Build the wire frame (stream ID must be 0 for GOAWAY)
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(8 + self.debug_data.len());
        buf.put_u32(self.last_stream_id & 0x7FFFFFFF);
        buf.put_u32(self.error_code.as_u32());
        buf.put_slice(&self.debug_data);
        Frame::new(FrameType::Goaway, FrameFlags::empty(), 0, buf.freeze())
    }
}

impl TryFrom<&Frame> for GoawayFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Goaway)?;
        if frame.payload.len() < 8 {
            return Err(Error::Framing("GOAWAY shorter than 8 bytes".to_string()));
        }
        Ok(GoawayFrame {
            last_stream_id: u32_at(&frame.payload, 0) & 0x7FFFFFFF,
            error_code: ErrorCode(u32_at(&frame.payload, 4)),
            debug_data: frame.payload.slice(8..),
        })
    }
}

/// WINDOW_UPDATE (Section 6.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: u32,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    /// Build the wire frame (reserved bit must be 0)
    pub fn to_frame(&self) -> Frame {
        let payload = Bytes::copy_from_slice(&(self.size_increment & 0x7FFFFFFF).to_be_bytes());
        Frame::new(FrameType::WindowUpdate, FrameFlags::empty(), self.stream_id, payload)
    }
}

impl TryFrom<&Frame> for WindowUpdateFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::WindowUpdate)?;
        expect_len(frame, 4)?;
        Ok(WindowUpdateFrame {
            stream_id: frame.stream_id,
            size_increment: u32_at(&frame.payload, 0) & 0x7FFFFFFF,
        })
    }
}

/// CONTINUATION (Section 6.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_headers: bool) -> Self {
        ContinuationFrame {
            stream_id,
            header_block,
            end_headers,
        }
    }

    /// Build the wire frame
    pub fn to_frame(&self) -> Frame {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, self.end_headers);
        Frame::new(FrameType::Continuation, flags, self.stream_id, self.header_block.clone())
    }
}

impl TryFrom<&Frame> for ContinuationFrame {
    type Error = Error;

    fn try_from(frame: &Frame) -> Result<Self> {
        expect_type(frame, FrameType::Continuation)?;
        Ok(ContinuationFrame {
            stream_id: frame.stream_id,
            header_block: frame.payload.clone(),
            end_headers: frame.flags.is_end_headers(),
        })
    }
}
