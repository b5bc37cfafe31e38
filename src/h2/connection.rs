//! HTTP/2 connection engine
//!
//! [`H2Connection`] owns the transport, both HPACK tables, the stream table
//! and the connection-level flow-control windows. Every frame in either
//! direction passes through it, in order, on the caller's thread.
//!
//! The engine has one suspension point: reading the next frame. All waits
//! are bounded by a deadline taken from the connection timeout (or passed
//! explicitly), and expiry is reported as [`Error::Timeout`].

use super::codec::FrameCodec;
use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use super::frames::*;
use super::headers::HeaderList;
use super::hpack::{Decoder, Encoder};
use super::settings::Settings;
use super::stream::{H2Stream, HeaderBlock, HeaderBlockKind, StreamId, StreamManager, StreamState};
use super::verify::ServerQuirks;
use super::{CONNECTION_PREFACE, CONNECTION_STREAM_ID};
use crate::session::{self, Session, SessionOps};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Size of the transport read buffer
const READ_CHUNK_SIZE: usize = 16384;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing sent yet
    New,
    /// Client preface written
    PrefaceSent,
    /// Peer SETTINGS received and acknowledged
    SettingsExchanged,
    /// Ready for streams
    Active,
    /// GOAWAY sent or received
    Closing,
    /// Transport closed
    Closed,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// SETTINGS advertised during the handshake
    pub settings: Settings,
    /// Default bound on every blocking operation (`None` waits forever)
    pub timeout: Option<Duration>,
    /// Acknowledge peer SETTINGS and PING automatically
    pub auto_ack: bool,
    /// Replenish receive windows with WINDOW_UPDATE once half is consumed
    pub auto_window_update: bool,
    /// `initialize` waits for the ACK of our SETTINGS
    pub wait_for_settings_ack: bool,
    /// Server behaviours tolerated by the receive helpers
    pub quirks: ServerQuirks,
}

impl Default for H2Config {
    fn default() -> Self {
        H2Config {
            settings: Settings::client_defaults(),
            timeout: Some(Duration::from_secs(10)),
            auto_ack: true,
            auto_window_update: false,
            wait_for_settings_ack: true,
            quirks: ServerQuirks::default(),
        }
    }
}

/// Builder for HTTP/2 connections
#[derive(Debug, Clone, Default)]
pub struct H2ConnectionBuilder {
    config: H2Config,
}

impl H2ConnectionBuilder {
    /// Create a new builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the advertised SETTINGS
    pub fn settings(mut self, settings: Settings) -> Self {
        self.config.settings = settings;
        self
    }

    /// Set SETTINGS_HEADER_TABLE_SIZE
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.settings.header_table_size = Some(size);
        self
    }

    /// Set SETTINGS_ENABLE_PUSH
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.config.settings.enable_push = Some(enable);
        self
    }

    /// Set SETTINGS_INITIAL_WINDOW_SIZE
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.settings.initial_window_size = Some(size);
        self
    }

    /// Set SETTINGS_MAX_FRAME_SIZE
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.settings.max_frame_size = Some(size);
        self
    }

    /// Set SETTINGS_MAX_CONCURRENT_STREAMS
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.settings.max_header_list_size = Some(size);
        self
    }

    /// Set the default operation timeout
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enable/disable automatic SETTINGS and PING acknowledgement
    pub fn auto_ack(mut self, enable: bool) -> Self {
        self.config.auto_ack = enable;
        self
    }

    /// Enable/disable automatic WINDOW_UPDATE on received DATA
    pub fn auto_window_update(mut self, enable: bool) -> Self {
        self.config.auto_window_update = enable;
        self
    }

    /// Wait for the peer's SETTINGS ACK during `initialize`
    pub fn wait_for_settings_ack(mut self, wait: bool) -> Self {
        self.config.wait_for_settings_ack = wait;
        self
    }

    /// Set the tolerated server quirks
    pub fn quirks(mut self, quirks: ServerQuirks) -> Self {
        self.config.quirks = quirks;
        self
    }

    /// Build a connection over `ops` without touching the wire
    pub fn build<S: SessionOps>(self, ops: S) -> Result<H2Connection<S>> {
        self.config.settings.validate()?;
        Ok(H2Connection::with_config(ops, self.config))
    }

    /// Build a connection and run the handshake
    pub fn connect<S: SessionOps>(self, ops: S) -> Result<H2Connection<S>> {
        let mut conn = self.build(ops)?;
        conn.initialize()?;
        Ok(conn)
    }
}

/// A complete response collected from one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H2Response {
    /// Final `:status`
    pub status: u16,
    /// 1xx header blocks, in arrival order
    pub informational: Vec<HeaderList>,
    /// Final response headers
    pub headers: HeaderList,
    /// Concatenated DATA payloads (padding removed)
    pub body: Bytes,
    /// Trailing headers, if any
    pub trailers: Option<HeaderList>,
}

/// Header block being reassembled from HEADERS/PUSH_PROMISE + CONTINUATION
#[derive(Debug)]
struct PendingBlock {
    stream_id: StreamId,
    end_stream: bool,
    promised_stream_id: Option<StreamId>,
    fragments: BytesMut,
}

/// HTTP/2 client connection
pub struct H2Connection<S: SessionOps> {
    session: Session<S>,
    config: H2Config,
    state: ConnectionState,
    codec: FrameCodec,
    read_buf: Vec<u8>,
    encoder: Encoder,
    decoder: Decoder,
    /// Our settings as last sent
    local_settings: Settings,
    /// Sent SETTINGS awaiting ACK, oldest first
    unacked_settings: VecDeque<Settings>,
    /// Peer settings, merged over the protocol defaults
    remote_settings: Settings,
    streams: StreamManager,
    /// Connection-level windows
    flow: FlowControl,
    continuation: Option<PendingBlock>,
    goaway: Option<GoawayFrame>,
    /// Highest peer-initiated stream we accepted
    last_peer_stream_id: StreamId,
}

impl<S: SessionOps> H2Connection<S> {
    /// Create a connection with the default configuration
    pub fn new(ops: S) -> Self {
        Self::with_config(ops, H2Config::default())
    }

    /// Create a connection with the given configuration
    pub fn with_config(ops: S, config: H2Config) -> Self {
        let mut session = Session::new(ops);
        session.set_timeout(config.timeout);

        H2Connection {
            session,
            state: ConnectionState::New,
            codec: FrameCodec::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            local_settings: Settings::new(),
            unacked_settings: VecDeque::new(),
            remote_settings: Settings::new(),
            streams: StreamManager::new(),
            flow: FlowControl::new(),
            continuation: None,
            goaway: None,
            last_peer_stream_id: 0,
            config,
        }
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the configuration
    pub fn config(&self) -> &H2Config {
        &self.config
    }

    /// Our settings as last sent
    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    /// Peer settings received so far
    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// GOAWAY received from the peer, if any
    pub fn peer_goaway(&self) -> Option<&GoawayFrame> {
        self.goaway.as_ref()
    }

    /// Look up a stream
    pub fn stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get_stream(stream_id)
    }

    /// Get a stream's state, if it is still tracked
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get_stream(stream_id).map(|s| s.state())
    }

    /// Connection-level send window
    pub fn send_window(&self) -> i64 {
        self.flow.send_window().size()
    }

    /// Connection-level receive window
    pub fn recv_window(&self) -> i64 {
        self.flow.recv_window().size()
    }

    /// Stream-level send window
    pub fn stream_send_window(&self, stream_id: StreamId) -> Option<i64> {
        self.streams
            .get_stream(stream_id)
            .map(|s| s.flow_control().send_window().size())
    }

    /// Get the HPACK encoder (headers we send)
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Get the HPACK decoder (headers we receive)
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Get the underlying session
    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    /// Get the underlying session mutably
    pub fn session_mut(&mut self) -> &mut Session<S> {
        &mut self.session
    }

    /// Change the default operation timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
        self.session.set_timeout(timeout);
    }

    /// Perform the connection preface and SETTINGS exchange.
    ///
    /// Writes the preface and our SETTINGS, requires the first peer frame to
    /// be a SETTINGS frame, acknowledges it and (unless disabled) waits for
    /// the ACK of ours. Any failure or expiry is a handshake error.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != ConnectionState::New {
            return Err(Error::Protocol(format!(
                "initialize called in state {:?}",
                self.state
            )));
        }

        let deadline = self.session.deadline();

        self.write_bytes(CONNECTION_PREFACE).map_err(handshake_error)?;
        self.state = ConnectionState::PrefaceSent;
        debug!("client preface sent");

        let settings = self.config.settings.clone();
        self.write_settings(settings).map_err(handshake_error)?;

        let first = self.read_frame(deadline).map_err(handshake_error)?;
        if first.frame_type != FrameType::Settings || first.is_ack() {
            return Err(Error::Handshake(format!(
                "expected SETTINGS as first server frame, got {}",
                first
            )));
        }

        let peer = SettingsFrame::try_from(&first).map_err(handshake_error)?;
        self.apply_remote_settings(&peer.settings).map_err(handshake_error)?;
        self.write_frame(&SettingsFrame::ack().to_frame())
            .map_err(handshake_error)?;
        self.state = ConnectionState::SettingsExchanged;
        debug!(settings = ?peer.settings, "server SETTINGS applied");

        while self.config.wait_for_settings_ack && !self.unacked_settings.is_empty() {
            let frame = self.read_frame(deadline).map_err(handshake_error)?;
            if frame.stream_id != CONNECTION_STREAM_ID {
                return Err(Error::Handshake(format!(
                    "unexpected {} before SETTINGS ACK",
                    frame
                )));
            }
            self.process_frame(&frame).map_err(handshake_error)?;
        }

        if self.state == ConnectionState::SettingsExchanged {
            self.state = ConnectionState::Active;
        }
        debug!(state = ?self.state, "handshake complete");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            ConnectionState::Active | ConnectionState::SettingsExchanged => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(Error::ConnectionClosed),
            state => Err(Error::Protocol(format!(
                "connection not initialized ({:?})",
                state
            ))),
        }
    }

    // ---- Wire I/O ----

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.session.write_all(bytes).map_err(|e| self.transport_error(e))
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.write_bytes(&bytes)?;
        trace!(frame = %frame, "sent");
        Ok(())
    }

    fn read_frame(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        loop {
            if let Some(frame) = self.codec.try_decode()? {
                trace!(frame = %frame, "received");
                return Ok(frame);
            }
            let n = match self.session.read_until(&mut self.read_buf, deadline) {
                Ok(n) => n,
                Err(e) => return Err(self.transport_error(e)),
            };
            self.codec.extend(&self.read_buf[..n]);
        }
    }

    fn transport_error(&mut self, err: session::Error) -> Error {
        if matches!(err, session::Error::ConnectionClosed) {
            if self.state != ConnectionState::Closed {
                debug!("transport closed");
            }
            self.state = ConnectionState::Closed;
        }
        Error::from(err)
    }

    fn write_settings(&mut self, settings: Settings) -> Result<()> {
        self.write_frame(&SettingsFrame::new(settings.clone()).to_frame())?;
        self.local_settings.merge(&settings);
        self.unacked_settings.push_back(settings);
        Ok(())
    }

    fn write_header_block(
        &mut self,
        stream_id: StreamId,
        block: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        let max = self.codec.max_send_size();
        if block.len() <= max {
            let frame = HeadersFrame::new(stream_id, block, end_stream, true).to_frame();
            return self.write_frame(&frame);
        }

        let mut rest = block;
        let first = rest.split_to(max);
        self.write_frame(&HeadersFrame::new(stream_id, first, end_stream, false).to_frame())?;
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            let last = rest.is_empty();
            self.write_frame(&ContinuationFrame::new(stream_id, chunk, last).to_frame())?;
        }
        Ok(())
    }

    // ---- Caller-facing send primitives ----

    /// Write one frame as given.
    ///
    /// DATA frames are charged against the connection and stream send
    /// windows; if either is too small the frame is not written and
    /// [`Error::FlowControl`] is returned. Stream state follows the frame's
    /// flags where the transition is legal; nothing else is validated, so
    /// deliberately out-of-order frames can be sent.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        match self.state {
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
            ConnectionState::Closing if frame.stream_id != CONNECTION_STREAM_ID => {
                return Err(Error::ConnectionClosed)
            }
            _ => {}
        }

        let stream_id = frame.stream_id;
        if frame.frame_type == FrameType::Data {
            let len = frame.payload_len();
            if !self.flow.can_send(len) {
                return Err(Error::FlowControl(format!(
                    "DATA of {} bytes exceeds connection window {}",
                    len,
                    self.flow.send_window().size()
                )));
            }
            if let Some(stream) = self.streams.get_stream(stream_id) {
                if !stream.flow_control().can_send(len) {
                    return Err(Error::FlowControl(format!(
                        "DATA of {} bytes exceeds stream {} window {}",
                        len,
                        stream_id,
                        stream.flow_control().send_window().size()
                    )));
                }
            }
        }

        self.write_frame(frame)?;

        match frame.frame_type {
            FrameType::Data => {
                let len = frame.payload_len();
                self.flow.consume_send_window(len)?;
                if let Some(stream) = self.streams.get_stream_mut(stream_id) {
                    stream.flow_control_mut().consume_send_window(len)?;
                    stream.observe_sent(false, frame.flags.is_end_stream());
                }
            }
            FrameType::Headers => {
                if let Some(stream) = self.streams.get_stream_mut(stream_id) {
                    stream.observe_sent(true, frame.flags.is_end_stream());
                }
            }
            FrameType::RstStream => {
                if let (Some(stream), Ok(rst)) = (
                    self.streams.get_stream_mut(stream_id),
                    RstStreamFrame::try_from(frame),
                ) {
                    let _ = stream.reset(rst.error_code);
                }
            }
            FrameType::Settings if !frame.flags.is_ack() => {
                if let Ok(settings) = Settings::decode(&frame.payload) {
                    self.local_settings.merge(&settings);
                    self.unacked_settings.push_back(settings);
                }
            }
            FrameType::Goaway => self.state = ConnectionState::Closing,
            _ => {}
        }
        Ok(())
    }

    /// Write raw bytes to the transport, bypassing all framing
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.write_bytes(bytes)
    }

    /// Open a new stream by sending its header block.
    ///
    /// Allocates the next odd stream ID. Blocks larger than the peer's max
    /// frame size are split into HEADERS + CONTINUATION.
    pub fn start_stream(&mut self, headers: &HeaderList, end_stream: bool) -> Result<StreamId> {
        self.ensure_active()?;
        self.streams.cleanup_closed_streams();

        if let Some(limit) = self.remote_settings.max_header_list_size {
            if headers.list_size() > limit as usize {
                warn!(
                    size = headers.list_size(),
                    limit, "header list exceeds peer SETTINGS_MAX_HEADER_LIST_SIZE"
                );
            }
        }

        let stream_id = self.streams.create_stream()?;
        let block = self.encoder.encode(headers);
        if let Some(stream) = self.streams.get_stream_mut(stream_id) {
            stream.send_headers(end_stream)?;
        }
        self.write_header_block(stream_id, block, end_stream)?;

        debug!(stream_id, end_stream, "stream started");
        Ok(stream_id)
    }

    /// Send a header block on an open stream (request trailers).
    pub fn send_headers(&mut self, stream_id: StreamId, headers: &HeaderList, end_stream: bool) -> Result<()> {
        self.ensure_active()?;
        self.streams.local_stream_mut(stream_id)?.send_headers(end_stream)?;
        let block = self.encoder.encode(headers);
        self.write_header_block(stream_id, block, end_stream)
    }

    /// Send a body on a stream, split into DATA frames.
    ///
    /// Frames are limited by the peer's max frame size and by both send
    /// windows. When a window runs out part way, the bytes already written
    /// are reported in [`Error::WouldBlock`]; retry with the remainder once
    /// a WINDOW_UPDATE has been received. END_STREAM goes on the last frame
    /// only.
    pub fn send_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> Result<()> {
        self.ensure_active()?;
        self.streams.local_stream_mut(stream_id)?.check_send()?;

        let max = self.codec.max_send_size();
        let mut sent = 0;
        loop {
            let stream_window = self
                .streams
                .get_stream(stream_id)
                .map(|s| s.flow_control().send_window().available())
                .unwrap_or(0);
            let remaining = data.len() - sent;
            let chunk = remaining
                .min(max)
                .min(self.flow.send_window().available())
                .min(stream_window);

            if chunk == 0 && remaining > 0 {
                debug!(stream_id, sent, remaining, "send window exhausted");
                return Err(Error::WouldBlock { stream_id, sent });
            }

            let last = chunk == remaining;
            let payload = Bytes::copy_from_slice(&data[sent..sent + chunk]);
            self.write_frame(&DataFrame::new(stream_id, payload, end_stream && last).to_frame())?;

            self.flow.consume_send_window(chunk)?;
            let stream = self.streams.local_stream_mut(stream_id)?;
            stream.flow_control_mut().consume_send_window(chunk)?;
            sent += chunk;

            if last {
                stream.send_data(end_stream)?;
                return Ok(());
            }
        }
    }

    /// Send RST_STREAM and close the stream locally
    pub fn reset_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.streams.local_stream_mut(stream_id)?.reset(error_code)?;
        self.write_frame(&RstStreamFrame::new(stream_id, error_code).to_frame())?;
        debug!(stream_id, %error_code, "stream reset");
        Ok(())
    }

    /// Send WINDOW_UPDATE for the connection (`stream_id` 0) or a stream
    pub fn send_window_update(&mut self, stream_id: StreamId, increment: u32) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        if stream_id == CONNECTION_STREAM_ID {
            self.flow.send_window_update(increment)?;
        } else {
            self.streams
                .local_stream_mut(stream_id)?
                .flow_control_mut()
                .send_window_update(increment)?;
        }
        self.write_frame(&WindowUpdateFrame::new(stream_id, increment).to_frame())
    }

    /// Send a PING; the ACK is returned by `receive_frame`
    pub fn ping(&mut self, data: [u8; 8]) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        self.write_frame(&PingFrame::new(data).to_frame())
    }

    /// Send new SETTINGS; they take effect locally once acknowledged
    pub fn send_settings(&mut self, settings: Settings) -> Result<()> {
        self.ensure_active()?;
        settings.validate()?;
        self.write_settings(settings)
    }

    /// Send GOAWAY and stop opening streams. Frames may still be received.
    pub fn goaway(&mut self, error_code: ErrorCode, debug_data: Bytes) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        let frame = GoawayFrame::new(self.last_peer_stream_id, error_code, debug_data);
        self.write_frame(&frame.to_frame())?;
        self.state = ConnectionState::Closing;
        debug!(%error_code, "GOAWAY sent");
        Ok(())
    }

    /// Send GOAWAY(NO_ERROR) if still possible and close the transport
    pub fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        if self.state != ConnectionState::New {
            // Best effort: the peer may already be gone
            let _ = self.goaway(ErrorCode::NO_ERROR, Bytes::new());
        }
        self.state = ConnectionState::Closed;
        self.session.close().map_err(Error::from)
    }

    // ---- Caller-facing receive primitives ----

    /// Receive the next frame, bounded by the connection timeout.
    ///
    /// DATA returned here belongs to the caller and is not held for later
    /// stream waits.
    pub fn receive_frame(&mut self) -> Result<Frame> {
        let deadline = self.session.deadline();
        self.receive_frame_until(deadline)
    }

    /// Receive the next frame within `timeout`
    pub fn receive_frame_within(&mut self, timeout: Duration) -> Result<Frame> {
        self.receive_frame_until(Some(Instant::now() + timeout))
    }

    /// Receive the next frame before `deadline`.
    ///
    /// The frame is fully applied to connection and stream state before it
    /// is returned. A partially received frame or header block survives a
    /// timeout and is completed by the next call.
    pub fn receive_frame_until(&mut self, deadline: Option<Instant>) -> Result<Frame> {
        if self.state == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }
        let frame = self.read_frame(deadline)?;
        self.process_frame(&frame)?;
        Ok(frame)
    }

    /// Wait for the next complete header block on `stream_id`.
    ///
    /// Control frames are applied and skipped. DATA for other streams is
    /// held for a later wait on that stream. Fails with
    /// [`Error::StreamReset`] if the peer resets the stream and
    /// [`Error::UnexpectedFrame`] if DATA on this stream arrives first.
    pub fn receive_headers(&mut self, stream_id: StreamId) -> Result<HeaderBlock> {
        let deadline = self.session.deadline();
        loop {
            let stream = self.streams.local_stream_mut(stream_id)?;
            if let Some(block) = stream.pop_block() {
                return Ok(block);
            }
            if let Some(error_code) = stream.reset_code() {
                return Err(Error::StreamReset {
                    stream_id,
                    error_code,
                });
            }
            if !stream.state().can_receive() && stream.state() != StreamState::ReservedRemote {
                return Err(Error::StreamClosed(stream_id));
            }
            self.ensure_stream_live(stream_id)?;

            let frame = self.receive_frame_until(deadline)?;
            if frame.frame_type == FrameType::Data {
                self.hold_data(&frame)?;
                if frame.stream_id == stream_id {
                    return Err(Error::UnexpectedFrame {
                        expected: format!("HEADERS on stream {}", stream_id),
                        got: frame.to_string(),
                    });
                }
            }
        }
    }

    /// Receive the next DATA frame on `stream_id`.
    ///
    /// DATA held by earlier waits comes first. With
    /// [`ServerQuirks::tolerate_leading_empty_data`] set, an empty first
    /// DATA frame without END_STREAM is skipped once.
    pub fn receive_data_frame(&mut self, stream_id: StreamId) -> Result<DataFrame> {
        let deadline = self.session.deadline();
        loop {
            let stream = self.streams.local_stream_mut(stream_id)?;
            let first = stream.data_frames_delivered() == 0;
            if let Some(data) = stream.pop_data() {
                if first
                    && self.config.quirks.tolerate_leading_empty_data
                    && data.data.is_empty()
                    && !data.end_stream
                {
                    warn!(stream_id, "skipping leading empty DATA frame");
                    continue;
                }
                return Ok(data);
            }
            if let Some(error_code) = stream.reset_code() {
                return Err(Error::StreamReset {
                    stream_id,
                    error_code,
                });
            }
            if !stream.state().can_receive() && stream.state() != StreamState::ReservedRemote {
                return Err(Error::StreamClosed(stream_id));
            }
            self.ensure_stream_live(stream_id)?;

            let frame = self.receive_frame_until(deadline)?;
            match frame.frame_type {
                FrameType::Data => self.hold_data(&frame)?,
                FrameType::Headers | FrameType::Continuation | FrameType::PushPromise
                    if frame.stream_id == stream_id =>
                {
                    return Err(Error::UnexpectedFrame {
                        expected: format!("DATA on stream {}", stream_id),
                        got: frame.to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    /// Collect DATA on `stream_id` until the peer ends the stream.
    ///
    /// Trailers that end the stream stay queued for `receive_headers`.
    pub fn receive_body(&mut self, stream_id: StreamId) -> Result<Bytes> {
        let deadline = self.session.deadline();
        let mut body = BytesMut::new();
        loop {
            let stream = self.streams.local_stream_mut(stream_id)?;
            while let Some(data) = stream.pop_data() {
                body.extend_from_slice(&data.data);
            }
            if let Some(error_code) = stream.reset_code() {
                return Err(Error::StreamReset {
                    stream_id,
                    error_code,
                });
            }
            if !stream.state().can_receive() {
                return Ok(body.freeze());
            }
            self.ensure_stream_live(stream_id)?;

            let frame = self.receive_frame_until(deadline)?;
            if frame.frame_type == FrameType::Data {
                self.hold_data(&frame)?;
            }
        }
    }

    /// Receive a full response: 1xx blocks, final headers, body, trailers
    pub fn receive_response(&mut self, stream_id: StreamId) -> Result<H2Response> {
        let mut informational = Vec::new();
        let headers = loop {
            let block = self.receive_headers(stream_id)?;
            match block.kind {
                HeaderBlockKind::Informational => informational.push(block.fields),
                HeaderBlockKind::Response => break block,
                kind => {
                    return Err(Error::Protocol(format!(
                        "expected response headers on stream {}, got {:?}",
                        stream_id, kind
                    )))
                }
            }
        };

        let status = headers.status().unwrap_or_default();
        let (body, trailers) = if headers.end_stream {
            (Bytes::new(), None)
        } else {
            let body = self.receive_body(stream_id)?;
            let trailers = match self.streams.get_stream_mut(stream_id).and_then(|s| s.pop_block()) {
                Some(block) if block.kind == HeaderBlockKind::Trailers => Some(block.fields),
                Some(block) => {
                    return Err(Error::Protocol(format!(
                        "unexpected {:?} header block after body on stream {}",
                        block.kind, stream_id
                    )))
                }
                None => None,
            };
            (body, trailers)
        };

        Ok(H2Response {
            status,
            informational,
            headers: headers.fields,
            body,
            trailers,
        })
    }

    /// Send a request and collect the response
    pub fn request(&mut self, headers: &HeaderList, body: Option<&[u8]>) -> Result<H2Response> {
        let stream_id = self.start_stream(headers, body.is_none())?;
        if let Some(body) = body {
            self.send_data(stream_id, body, true)?;
        }
        self.receive_response(stream_id)
    }

    /// Keep a DATA frame read by a stream wait for its own stream
    fn hold_data(&mut self, frame: &Frame) -> Result<()> {
        let data = DataFrame::try_from(frame)?;
        if let Some(stream) = self.streams.get_stream_mut(frame.stream_id) {
            stream.push_data(data);
        }
        Ok(())
    }

    /// Fail instead of waiting for frames the peer will never send
    fn ensure_stream_live(&self, stream_id: StreamId) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            ConnectionState::Closing => match &self.goaway {
                // Streams at or below last_stream_id may still complete
                Some(goaway) if stream_id <= goaway.last_stream_id => Ok(()),
                _ => Err(Error::ConnectionClosed),
            },
            _ => Ok(()),
        }
    }

    // ---- Receive-side bookkeeping ----

    fn process_frame(&mut self, frame: &Frame) -> Result<()> {
        if let Some(pending) = &self.continuation {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "header block on stream {} interrupted by {}",
                    pending.stream_id, frame
                )));
            }
        }

        match frame.frame_type {
            FrameType::Data => self.on_data(frame),
            FrameType::Headers => {
                require_stream(frame)?;
                let headers = HeadersFrame::try_from(frame)?;
                if let (Some(priority), Some(stream)) =
                    (headers.priority, self.streams.get_stream_mut(frame.stream_id))
                {
                    stream.set_priority(priority);
                }
                self.on_header_fragment(PendingBlock {
                    stream_id: frame.stream_id,
                    end_stream: headers.end_stream,
                    promised_stream_id: None,
                    fragments: BytesMut::from(&headers.header_block[..]),
                }, headers.end_headers)
            }
            FrameType::PushPromise => {
                require_stream(frame)?;
                let promise = PushPromiseFrame::try_from(frame)?;
                if !self.local_settings.get_enable_push() {
                    return Err(Error::Protocol(format!(
                        "PUSH_PROMISE for stream {} with push disabled",
                        promise.promised_stream_id
                    )));
                }
                self.streams.reserve_remote(promise.promised_stream_id)?;
                self.last_peer_stream_id = self.last_peer_stream_id.max(promise.promised_stream_id);
                self.on_header_fragment(PendingBlock {
                    stream_id: frame.stream_id,
                    end_stream: false,
                    promised_stream_id: Some(promise.promised_stream_id),
                    fragments: BytesMut::from(&promise.header_block[..]),
                }, promise.end_headers)
            }
            FrameType::Continuation => {
                let continuation = ContinuationFrame::try_from(frame)?;
                let mut pending = self.continuation.take().ok_or_else(|| {
                    Error::Protocol(format!(
                        "CONTINUATION on stream {} without HEADERS",
                        frame.stream_id
                    ))
                })?;
                pending.fragments.extend_from_slice(&continuation.header_block);
                self.on_header_fragment(pending, continuation.end_headers)
            }
            FrameType::Priority => {
                require_stream(frame)?;
                let priority = PriorityFrame::try_from(frame)?;
                if let Some(stream) = self.streams.get_stream_mut(frame.stream_id) {
                    stream.set_priority(priority.priority);
                }
                Ok(())
            }
            FrameType::RstStream => {
                require_stream(frame)?;
                let rst = RstStreamFrame::try_from(frame)?;
                match self.streams.get_stream_mut(frame.stream_id) {
                    Some(stream) => {
                        stream.reset(rst.error_code)?;
                        debug!(stream_id = frame.stream_id, error_code = %rst.error_code, "stream reset by peer");
                        Ok(())
                    }
                    None => Err(self.missing_stream(frame)),
                }
            }
            FrameType::Settings => {
                let settings = SettingsFrame::try_from(frame)?;
                if settings.ack {
                    let acked = self.unacked_settings.pop_front().ok_or_else(|| {
                        Error::Protocol("SETTINGS ACK without pending SETTINGS".to_string())
                    })?;
                    self.apply_local_settings(&acked)
                } else {
                    self.apply_remote_settings(&settings.settings)?;
                    if self.config.auto_ack {
                        self.write_frame(&SettingsFrame::ack().to_frame())?;
                    }
                    Ok(())
                }
            }
            FrameType::Ping => {
                require_connection(frame)?;
                let ping = PingFrame::try_from(frame)?;
                if !ping.ack && self.config.auto_ack {
                    self.write_frame(&PingFrame::ack(ping.data).to_frame())?;
                }
                Ok(())
            }
            FrameType::Goaway => {
                require_connection(frame)?;
                let goaway = GoawayFrame::try_from(frame)?;
                warn!(
                    last_stream_id = goaway.last_stream_id,
                    error_code = %goaway.error_code,
                    "GOAWAY received"
                );
                self.goaway = Some(goaway);
                if self.state != ConnectionState::Closed {
                    self.state = ConnectionState::Closing;
                }
                Ok(())
            }
            FrameType::WindowUpdate => {
                let update = WindowUpdateFrame::try_from(frame)?;
                if frame.stream_id == CONNECTION_STREAM_ID {
                    self.flow.increase_send_window(update.size_increment)?;
                } else if let Some(stream) = self.streams.get_stream_mut(frame.stream_id) {
                    stream
                        .flow_control_mut()
                        .increase_send_window(update.size_increment)?;
                } else {
                    trace!(stream_id = frame.stream_id, "WINDOW_UPDATE for untracked stream");
                }
                Ok(())
            }
            FrameType::Unknown(ty) => {
                trace!(frame_type = ty, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn on_data(&mut self, frame: &Frame) -> Result<()> {
        require_stream(frame)?;
        let data = DataFrame::try_from(frame)?;
        let len = data.frame_size();

        self.flow.consume_recv_window(len)?;
        match self.streams.get_stream_mut(frame.stream_id) {
            Some(stream) => stream.receive_data(len, data.end_stream)?,
            None => return Err(self.missing_stream(frame)),
        }

        if self.config.auto_window_update {
            self.replenish_windows(frame.stream_id)?;
        }
        Ok(())
    }

    fn replenish_windows(&mut self, stream_id: StreamId) -> Result<()> {
        if let Some(increment) = self.flow.should_send_window_update() {
            self.send_window_update(CONNECTION_STREAM_ID, increment)?;
        }
        let increment = self
            .streams
            .get_stream(stream_id)
            .filter(|s| s.state().can_receive())
            .and_then(|s| s.flow_control().should_send_window_update());
        if let Some(increment) = increment {
            self.send_window_update(stream_id, increment)?;
        }
        Ok(())
    }

    fn on_header_fragment(&mut self, pending: PendingBlock, end_headers: bool) -> Result<()> {
        if !end_headers {
            self.continuation = Some(pending);
            return Ok(());
        }

        // Decode before any stream checks so the HPACK state stays in sync
        let fields = self.decoder.decode(&pending.fragments)?;

        if let Some(promised) = pending.promised_stream_id {
            if let Some(stream) = self.streams.get_stream_mut(promised) {
                stream.push_block(HeaderBlock {
                    stream_id: promised,
                    kind: HeaderBlockKind::PushPromise,
                    end_stream: false,
                    fields,
                });
            }
            return Ok(());
        }

        let stream_id = pending.stream_id;
        if self.streams.get_stream(stream_id).is_none() {
            return Err(if self.streams.was_used(stream_id) {
                Error::StreamClosed(stream_id)
            } else {
                Error::Protocol(format!("HEADERS on stream {} the client never opened", stream_id))
            });
        }
        let stream = self.streams.local_stream_mut(stream_id)?;
        let kind = stream.receive_headers(&fields, pending.end_stream)?;
        debug!(stream_id, ?kind, fields = fields.len(), "header block received");
        stream.push_block(HeaderBlock {
            stream_id,
            kind,
            end_stream: pending.end_stream,
            fields,
        });
        Ok(())
    }

    fn missing_stream(&self, frame: &Frame) -> Error {
        if self.streams.was_used(frame.stream_id) {
            Error::StreamClosed(frame.stream_id)
        } else {
            Error::Protocol(format!("{} on idle stream", frame))
        }
    }

    fn apply_remote_settings(&mut self, settings: &Settings) -> Result<()> {
        if let Some(size) = settings.header_table_size {
            self.encoder.set_max_table_size(size as usize);
        }
        if let Some(size) = settings.initial_window_size {
            self.streams.update_initial_send_window(size)?;
        }
        if let Some(size) = settings.max_frame_size {
            self.codec.set_max_send_size(size as usize);
        }
        if settings.max_concurrent_streams.is_some() {
            self.streams.set_max_concurrent_streams(settings.max_concurrent_streams);
        }
        self.remote_settings.merge(settings);
        debug!(?settings, "peer settings applied");
        Ok(())
    }

    fn apply_local_settings(&mut self, settings: &Settings) -> Result<()> {
        if let Some(size) = settings.header_table_size {
            self.decoder.set_allowed_table_size(size as usize);
        }
        if let Some(size) = settings.max_header_list_size {
            self.decoder.set_max_header_list_size(Some(size as usize));
        }
        if let Some(size) = settings.max_frame_size {
            self.codec.set_max_recv_size(size as usize);
        }
        if let Some(size) = settings.initial_window_size {
            for stream in self.streams.streams_mut() {
                stream.flow_control_mut().recv_window_mut().resize(size)?;
            }
            self.streams.set_initial_recv_window(size);
        }
        debug!(?settings, "local settings acknowledged");
        Ok(())
    }
}

impl<S: SessionOps> Drop for H2Connection<S> {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            let _ = self.session.close();
        }
    }
}

fn handshake_error(err: Error) -> Error {
    match err {
        Error::Timeout => Error::Handshake("timed out waiting for server SETTINGS".to_string()),
        Error::ConnectionClosed => Error::Handshake("connection closed during handshake".to_string()),
        Error::Handshake(msg) => Error::Handshake(msg),
        other => Error::Handshake(other.to_string()),
    }
}

fn require_stream(frame: &Frame) -> Result<()> {
    if frame.stream_id == CONNECTION_STREAM_ID {
        return Err(Error::Protocol(format!("{} on stream 0", frame.frame_type.name())));
    }
    Ok(())
}

fn require_connection(frame: &Frame) -> Result<()> {
    if frame.stream_id != CONNECTION_STREAM_ID {
        return Err(Error::Protocol(format!(
            "{} on stream {}",
            frame.frame_type.name(),
            frame.stream_id
        )));
    }
    Ok(())
}
