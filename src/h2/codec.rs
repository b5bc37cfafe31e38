//! HTTP/2 frame encoding and decoding
//!
//! Byte-level conversion between [`Frame`] values and the 9-octet header plus
//! payload wire layout. Flags that have no meaning for a frame's type are
//! dropped in both directions; unknown frame types pass through untouched.

use super::error::{Error, Result};
use super::frames::{Frame, FrameFlags, FrameType};
use super::DEFAULT_MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Largest payload length expressible in the 24-bit length field
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Frame codec for encoding/decoding HTTP/2 frames
///
/// Holds the two negotiated size limits and a receive buffer for
/// reassembling frames out of arbitrarily split reads.
#[derive(Debug)]
pub struct FrameCodec {
    /// Buffer for reading
    read_buffer: BytesMut,
    /// Largest payload we accept (our SETTINGS_MAX_FRAME_SIZE)
    max_recv_size: usize,
    /// Largest payload we may send (peer's SETTINGS_MAX_FRAME_SIZE)
    max_send_size: usize,
}

impl FrameCodec {
    /// Create a new frame codec with the protocol default limits
    pub fn new() -> Self {
        FrameCodec {
            read_buffer: BytesMut::with_capacity(4096),
            max_recv_size: DEFAULT_MAX_FRAME_SIZE as usize,
            max_send_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    /// Get the largest payload accepted on decode
    pub fn max_recv_size(&self) -> usize {
        self.max_recv_size
    }

    /// Set the largest payload accepted on decode
    pub fn set_max_recv_size(&mut self, size: usize) {
        self.max_recv_size = size.min(MAX_FRAME_SIZE);
    }

    /// Get the largest payload allowed on encode
    pub fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    /// Set the largest payload allowed on encode
    pub fn set_max_send_size(&mut self, size: usize) {
        self.max_send_size = size.min(MAX_FRAME_SIZE);
    }

    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // Length (24 bits, big-endian)
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;

        header[3] = frame_type.as_u8();
        header[4] = flags.masked(frame_type.defined_flags()).as_u8();

        // Stream ID (31 bits, reserved bit is 0)
        header[5..9].copy_from_slice(&(stream_id & 0x7FFFFFFF).to_be_bytes());

        header
    }

    /// Decode a frame header into (type, flags, stream id, payload length)
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (FrameType, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);

        let frame_type = FrameType::from_u8(bytes[3]);
        let flags = FrameFlags::from_u8(bytes[4]).masked(frame_type.defined_flags());

        // Ignore the reserved bit
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFFFFFF;

        (frame_type, flags, stream_id, length)
    }

    /// Encode a frame without checking the negotiated size limit
    pub fn encode_frame(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        buf.put_slice(&Self::encode_header(
            frame.frame_type,
            frame.flags,
            frame.stream_id,
            frame.payload.len(),
        ));
        buf.put_slice(&frame.payload);
        buf.freeze()
    }

    /// Encode a frame, failing if its payload exceeds the peer's max frame size
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        if frame.payload.len() > self.max_send_size {
            return Err(Error::Encoding(format!(
                "{} payload of {} bytes exceeds max frame size {}",
                frame.frame_type.name(),
                frame.payload.len(),
                self.max_send_size
            )));
        }
        Ok(Self::encode_frame(frame))
    }

    /// Decode exactly one frame from `bytes`.
    ///
    /// Fails if fewer than 9 bytes are present, if the declared length is
    /// over the limit, or if the payload is truncated.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame> {
        let header = header_of(bytes).ok_or_else(|| {
            Error::Framing(format!(
                "Need {} bytes for a frame header, have {}",
                FRAME_HEADER_SIZE,
                bytes.len()
            ))
        })?;

        let (frame_type, flags, stream_id, length) = Self::decode_header(&header);
        self.check_length(frame_type, length)?;

        let available = bytes.len() - FRAME_HEADER_SIZE;
        if available < length {
            return Err(Error::Framing(format!(
                "Truncated {} frame: declared {} bytes, have {}",
                frame_type.name(),
                length,
                available
            )));
        }

        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length]);
        Ok(Frame::new(frame_type, flags, stream_id, payload))
    }

    /// Append received bytes to the read buffer
    pub fn extend(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Take one complete frame out of the read buffer, if there is one.
    ///
    /// An oversized length is reported as soon as the header is visible.
    pub fn try_decode(&mut self) -> Result<Option<Frame>> {
        let header = match header_of(&self.read_buffer) {
            Some(header) => header,
            None => return Ok(None),
        };

        let (frame_type, flags, stream_id, length) = Self::decode_header(&header);
        self.check_length(frame_type, length)?;

        if self.read_buffer.len() < FRAME_HEADER_SIZE + length {
            self.read_buffer.reserve(FRAME_HEADER_SIZE + length - self.read_buffer.len());
            return Ok(None);
        }

        self.read_buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(length).freeze();
        Ok(Some(Frame::new(frame_type, flags, stream_id, payload)))
    }

    fn check_length(&self, frame_type: FrameType, length: usize) -> Result<()> {
        if length > self.max_recv_size {
            return Err(Error::Framing(format!(
                "{} frame length {} exceeds max frame size {}",
                frame_type.name(),
                length,
                self.max_recv_size
            )));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn header_of(bytes: &[u8]) -> Option<[u8; FRAME_HEADER_SIZE]> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(bytes.get(..FRAME_HEADER_SIZE)?);
    Some(header)
}
