//! Client-side stream lifecycle (RFC 7540 Section 5.1)
//!
//! The connection owns every [`H2Stream`] through its [`StreamManager`];
//! nothing else holds a stream.

use super::error::{Error, ErrorCode, Result};
use super::flow_control::FlowControl;
use super::frames::{DataFrame, PrioritySpec};
use super::headers::HeaderList;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_STREAM_ID};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

pub type StreamId = u32;

/// Where a stream sits in the RFC 7540 state diagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Promised by the server in a PUSH_PROMISE
    ReservedRemote,
    Open,
    /// We sent END_STREAM
    HalfClosedLocal,
    /// The server sent END_STREAM
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// We may still send DATA
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// The server may still send DATA
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// What a decoded header block means for its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBlockKind {
    /// 1xx response headers; any number may precede the final response
    Informational,
    /// Final response headers
    Response,
    /// Trailing headers after the body
    Trailers,
    /// Request headers promised with PUSH_PROMISE
    PushPromise,
}

/// A complete, decoded header block for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Stream the block belongs to
    pub stream_id: StreamId,
    /// Informational, response, trailers or promised request
    pub kind: HeaderBlockKind,
    /// END_STREAM was set on the HEADERS frame
    pub end_stream: bool,
    /// Decoded fields in wire order
    pub fields: HeaderList,
}

impl HeaderBlock {
    /// Get the `:status` value, if any
    pub fn status(&self) -> Option<u16> {
        self.fields.status()
    }
}

/// HTTP/2 stream
#[derive(Debug)]
pub struct H2Stream {
    /// Stream ID
    id: StreamId,
    /// Stream state
    state: StreamState,
    /// Flow control
    flow_control: FlowControl,
    /// Priority information
    priority: Option<PrioritySpec>,
    /// Final (non-1xx) response headers seen
    response_headers_received: bool,
    /// Trailers seen
    trailers_received: bool,
    /// Error code of the RST_STREAM that closed the stream
    reset_code: Option<ErrorCode>,
    /// Decoded header blocks not yet handed to the caller
    pending_blocks: VecDeque<HeaderBlock>,
    /// DATA read while the caller waited on another stream
    pending_data: VecDeque<DataFrame>,
    /// DATA frames handed to the caller, skipped ones included
    data_frames_delivered: usize,
}

impl H2Stream {
    /// Create a new stream
    pub fn new(id: StreamId) -> Self {
        Self::with_window_sizes(id, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn with_window_sizes(id: StreamId, send_size: u32, recv_size: u32) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            flow_control: FlowControl::with_initial_sizes(send_size, recv_size),
            priority: None,
            response_headers_received: false,
            trailers_received: false,
            reset_code: None,
            pending_blocks: VecDeque::new(),
            pending_data: VecDeque::new(),
            data_frames_delivered: 0,
        }
    }

    /// Get stream state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Get flow control
    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    /// Get mutable flow control
    pub fn flow_control_mut(&mut self) -> &mut FlowControl {
        &mut self.flow_control
    }

    /// Get priority
    pub fn priority(&self) -> Option<&PrioritySpec> {
        self.priority.as_ref()
    }

    /// Set priority
    pub fn set_priority(&mut self, priority: PrioritySpec) {
        self.priority = Some(priority);
    }

    /// Check if final response headers have arrived
    pub fn response_headers_received(&self) -> bool {
        self.response_headers_received
    }

    /// Trailers may still arrive: final headers seen, stream not ended
    pub fn trailers_allowed(&self) -> bool {
        self.response_headers_received && !self.trailers_received && self.state.can_receive()
    }

    /// Error code of the RST_STREAM that closed this stream, if any
    pub fn reset_code(&self) -> Option<ErrorCode> {
        self.reset_code
    }

    /// Queue a decoded header block for the caller
    pub fn push_block(&mut self, block: HeaderBlock) {
        self.pending_blocks.push_back(block);
    }

    /// Take the oldest undelivered header block
    pub fn pop_block(&mut self) -> Option<HeaderBlock> {
        self.pending_blocks.pop_front()
    }

    /// Check for undelivered header blocks
    pub fn has_pending_blocks(&self) -> bool {
        !self.pending_blocks.is_empty()
    }

    /// Hold a DATA frame until a wait on this stream picks it up
    pub fn push_data(&mut self, data: DataFrame) {
        self.pending_data.push_back(data);
    }

    /// Take the oldest held DATA frame
    pub fn pop_data(&mut self) -> Option<DataFrame> {
        let data = self.pending_data.pop_front()?;
        self.data_frames_delivered += 1;
        Some(data)
    }

    /// Check for held DATA frames
    pub fn has_pending_data(&self) -> bool {
        !self.pending_data.is_empty()
    }

    /// Number of DATA frames taken with `pop_data`
    pub fn data_frames_delivered(&self) -> usize {
        self.data_frames_delivered
    }

    fn transition(&mut self, state: StreamState) {
        if self.state != state {
            debug!(stream_id = self.id, from = ?self.state, to = ?state, "stream state");
            self.state = state;
        }
    }

    fn close_local(&mut self) {
        let next = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.transition(next);
    }

    fn close_remote(&mut self) {
        let next = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        self.transition(next);
    }

    fn closed_error(&self) -> Error {
        Error::StreamClosed(self.id)
    }

    /// Prepare to send HEADERS
    pub fn send_headers(&mut self, end_stream: bool) -> Result<()> {
        match self.state {
            StreamState::Idle => {
                self.transition(StreamState::Open);
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                // Request trailers
                if !end_stream {
                    return Err(Error::Protocol(format!(
                        "Trailers on stream {} must carry END_STREAM",
                        self.id
                    )));
                }
            }
            StreamState::Closed => return Err(self.closed_error()),
            state => {
                return Err(Error::InvalidStreamState {
                    stream_id: self.id,
                    state,
                })
            }
        }

        if end_stream {
            self.close_local();
        }
        Ok(())
    }

    /// Check that the local half is still open for DATA
    pub fn check_send(&self) -> Result<()> {
        if self.state.can_send() {
            return Ok(());
        }
        if self.state.is_closed() {
            return Err(self.closed_error());
        }
        Err(Error::InvalidStreamState {
            stream_id: self.id,
            state: self.state,
        })
    }

    /// Check that DATA may be sent and apply END_STREAM
    pub fn send_data(&mut self, end_stream: bool) -> Result<()> {
        self.check_send()?;
        if end_stream {
            self.close_local();
        }
        Ok(())
    }

    /// Classify an incoming header block and apply END_STREAM
    pub fn receive_headers(&mut self, fields: &HeaderList, end_stream: bool) -> Result<HeaderBlockKind> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::ReservedRemote => {
                self.transition(StreamState::HalfClosedLocal);
            }
            StreamState::HalfClosedRemote | StreamState::Closed => return Err(self.closed_error()),
            StreamState::Idle => {
                return Err(Error::Protocol(format!(
                    "HEADERS on idle stream {}",
                    self.id
                )))
            }
        }

        let kind = if !self.response_headers_received {
            let status = fields.status().ok_or_else(|| {
                Error::Protocol(format!("Response on stream {} without valid :status", self.id))
            })?;
            if (100..200).contains(&status) {
                if end_stream {
                    return Err(Error::Protocol(format!(
                        "Informational response {} on stream {} carries END_STREAM",
                        status, self.id
                    )));
                }
                HeaderBlockKind::Informational
            } else {
                self.response_headers_received = true;
                HeaderBlockKind::Response
            }
        } else {
            if !end_stream {
                return Err(Error::Protocol(format!(
                    "Trailers on stream {} without END_STREAM",
                    self.id
                )));
            }
            self.trailers_received = true;
            HeaderBlockKind::Trailers
        };

        if end_stream {
            self.close_remote();
        }
        Ok(kind)
    }

    /// Account for an incoming DATA frame of `len` flow-controlled bytes
    pub fn receive_data(&mut self, len: usize, end_stream: bool) -> Result<()> {
        if !self.state.can_receive() {
            return Err(self.closed_error());
        }
        if !self.response_headers_received {
            return Err(Error::Protocol(format!(
                "DATA on stream {} before response headers",
                self.id
            )));
        }

        self.flow_control.consume_recv_window(len)?;

        if end_stream {
            self.close_remote();
        }
        Ok(())
    }

    /// Apply RST_STREAM, sent or received. A stream can only be reset once.
    pub fn reset(&mut self, error_code: ErrorCode) -> Result<()> {
        if self.reset_code.is_some() {
            return Err(self.closed_error());
        }
        self.reset_code = Some(error_code);
        self.transition(StreamState::Closed);
        Ok(())
    }

    /// Track a frame the caller wrote directly, without validating it
    pub(crate) fn observe_sent(&mut self, opens: bool, end_stream: bool) {
        if opens && self.state == StreamState::Idle {
            self.transition(StreamState::Open);
        }
        if end_stream {
            self.close_local();
        }
    }

    /// Mark a pushed stream as promised
    pub fn reserve_remote(&mut self) {
        self.transition(StreamState::ReservedRemote);
    }
}

/// Stream manager
///
/// Owns all streams for a connection and allocates client stream IDs.
#[derive(Debug)]
pub struct StreamManager {
    /// Known streams, including closed ones with undelivered blocks or DATA
    streams: HashMap<StreamId, H2Stream>,
    /// Next client stream ID (odd)
    next_stream_id: StreamId,
    /// Peer's SETTINGS_MAX_CONCURRENT_STREAMS
    max_concurrent_streams: Option<u32>,
    /// Initial send window for new streams (peer's SETTINGS_INITIAL_WINDOW_SIZE)
    initial_send_window: u32,
    /// Initial receive window for new streams (our SETTINGS_INITIAL_WINDOW_SIZE)
    initial_recv_window: u32,
}

impl StreamManager {
    /// Create a new stream manager for the client side
    pub fn new() -> Self {
        StreamManager {
            streams: HashMap::new(),
            next_stream_id: 1,
            max_concurrent_streams: None,
            initial_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_recv_window: DEFAULT_INITIAL_WINDOW_SIZE,
        }
    }

    /// Cap on locally opened streams; `None` lifts it
    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    /// Set the receive window new streams start with
    pub fn set_initial_recv_window(&mut self, size: u32) {
        self.initial_recv_window = size;
    }

    /// Apply a new peer SETTINGS_INITIAL_WINDOW_SIZE to every stream's send
    /// window and to streams created later
    pub fn update_initial_send_window(&mut self, size: u32) -> Result<()> {
        for stream in self.streams.values_mut() {
            stream.flow_control_mut().send_window_mut().resize(size)?;
        }
        self.initial_send_window = size;
        Ok(())
    }

    /// Id the next `create_stream` will hand out
    pub fn peek_next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }

    /// Allocate next stream ID and create an idle stream
    pub fn create_stream(&mut self) -> Result<StreamId> {
        if let Some(max) = self.max_concurrent_streams {
            if self.active_stream_count() >= max as usize {
                return Err(Error::TooManyStreams);
            }
        }

        let stream_id = self.next_stream_id;
        if stream_id > MAX_STREAM_ID {
            return Err(Error::Protocol("Stream IDs exhausted".to_string()));
        }
        self.next_stream_id += 2;

        let stream = H2Stream::with_window_sizes(stream_id, self.initial_send_window, self.initial_recv_window);
        self.streams.insert(stream_id, stream);

        Ok(stream_id)
    }

    /// Register a stream promised by the peer
    pub fn reserve_remote(&mut self, stream_id: StreamId) -> Result<()> {
        if stream_id == 0 || stream_id % 2 == 1 || self.streams.contains_key(&stream_id) {
            return Err(Error::Protocol(format!(
                "Invalid promised stream ID {}",
                stream_id
            )));
        }
        let mut stream = H2Stream::with_window_sizes(stream_id, self.initial_send_window, self.initial_recv_window);
        stream.reserve_remote();
        self.streams.insert(stream_id, stream);
        Ok(())
    }

    /// Get a stream by ID
    pub fn get_stream(&self, stream_id: StreamId) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Get a mutable stream by ID
    pub fn get_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut H2Stream> {
        self.streams.get_mut(&stream_id)
    }

    /// Look up a stream for a local operation.
    ///
    /// A client ID that was allocated but has since been removed reports
    /// `StreamClosed`; one that never existed reports `StreamNotFound`.
    pub fn local_stream_mut(&mut self, stream_id: StreamId) -> Result<&mut H2Stream> {
        let was_used = self.was_used(stream_id);
        self.streams.get_mut(&stream_id).ok_or(if was_used {
            Error::StreamClosed(stream_id)
        } else {
            Error::StreamNotFound(stream_id)
        })
    }

    /// Check if a client stream ID has already been handed out
    pub fn was_used(&self, stream_id: StreamId) -> bool {
        stream_id % 2 == 1 && stream_id < self.next_stream_id
    }

    /// Get number of streams counting toward the concurrency limit
    pub fn active_stream_count(&self) -> usize {
        self.streams
            .values()
            .filter(|s| !matches!(s.state(), StreamState::Closed | StreamState::Idle))
            .count()
    }

    /// Iterate mutably over all streams
    pub fn streams_mut(&mut self) -> impl Iterator<Item = &mut H2Stream> {
        self.streams.values_mut()
    }

    /// Drop closed streams with nothing left to deliver
    pub fn cleanup_closed_streams(&mut self) {
        self.streams.retain(|_, stream| {
            !stream.state().is_closed() || stream.has_pending_blocks() || stream.has_pending_data()
        });
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}
