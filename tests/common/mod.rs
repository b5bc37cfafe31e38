//! Scripted HTTP/2 peer for integration tests
//!
//! The peer runs on its own thread over a real TCP socket. It frames with
//! the crate's codec but compresses headers with the independent `hpack`
//! crate, so both HPACK implementations are checked against each other.

#![allow(dead_code)]

use bytes::Bytes;
use h2probe::h2::codec::FrameCodec;
use h2probe::h2::{
    ContinuationFrame, Frame, FrameType, H2Connection, H2ConnectionBuilder, HeadersFrame,
    Settings, SettingsFrame, CONNECTION_PREFACE,
};
use h2probe::session::TcpSessionOps;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Server side of one test connection
pub struct Peer<S = TcpStream> {
    stream: S,
    codec: FrameCodec,
    buf: Vec<u8>,
    pub encoder: hpack::Encoder<'static>,
    pub decoder: hpack::Decoder<'static>,
}

impl<S: Read + Write> Peer<S> {
    pub fn new(stream: S) -> Self {
        Peer {
            stream,
            codec: FrameCodec::new(),
            buf: vec![0u8; 16384],
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    /// Read the client preface and SETTINGS without answering
    pub fn read_preface(&mut self) -> Settings {
        let mut preface = [0u8; 24];
        self.stream.read_exact(&mut preface).unwrap();
        assert_eq!(&preface[..], CONNECTION_PREFACE);

        let frame = self.read_frame();
        assert_eq!(frame.frame_type, FrameType::Settings);
        assert!(!frame.is_ack());
        SettingsFrame::try_from(&frame).unwrap().settings
    }

    /// Full server side of the handshake; returns the client's settings
    pub fn handshake(&mut self, settings: Settings) -> Settings {
        let client = self.read_preface();
        self.send(&SettingsFrame::new(settings).to_frame());
        self.send(&SettingsFrame::ack().to_frame());

        let ack = self.read_frame();
        assert!(ack.frame_type == FrameType::Settings && ack.is_ack(), "got {}", ack);
        client
    }

    pub fn read_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.try_decode().unwrap() {
                return frame;
            }
            let n = self.stream.read(&mut self.buf).unwrap();
            assert!(n > 0, "client closed the connection");
            self.codec.extend(&self.buf[..n]);
        }
    }

    /// Read frames until the client closes the transport
    pub fn wait_closed(&mut self) {
        loop {
            if let Ok(Some(_)) = self.codec.try_decode() {
                continue;
            }
            match self.stream.read(&mut self.buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => self.codec.extend(&self.buf[..n]),
            }
        }
    }

    pub fn send(&mut self, frame: &Frame) {
        self.stream.write_all(&FrameCodec::encode_frame(frame)).unwrap();
    }

    pub fn encode(&mut self, headers: &[(&str, &str)]) -> Bytes {
        let block = self
            .encoder
            .encode(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        Bytes::from(block)
    }

    pub fn send_headers(&mut self, stream_id: u32, headers: &[(&str, &str)], end_stream: bool) {
        let block = self.encode(headers);
        self.send(&HeadersFrame::new(stream_id, block, end_stream, true).to_frame());
    }

    /// Send a header block split into HEADERS plus `pieces - 1` CONTINUATION frames
    pub fn send_headers_split(
        &mut self,
        stream_id: u32,
        headers: &[(&str, &str)],
        end_stream: bool,
        pieces: usize,
    ) {
        let mut block = self.encode(headers);
        let step = block.len().div_ceil(pieces);

        let first = block.split_to(step.min(block.len()));
        self.send(&HeadersFrame::new(stream_id, first, end_stream, block.is_empty()).to_frame());
        while !block.is_empty() {
            let chunk = block.split_to(step.min(block.len()));
            let last = block.is_empty();
            self.send(&ContinuationFrame::new(stream_id, chunk, last).to_frame());
        }
    }

    /// Decode a HEADERS frame's block (END_HEADERS required)
    pub fn decode_headers(&mut self, frame: &Frame) -> Vec<(String, String)> {
        let headers = HeadersFrame::try_from(frame).unwrap();
        assert!(headers.end_headers);
        self.decoder
            .decode(&headers.header_block)
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }
}

/// Bind a local listener and run `script` against the first connection
pub fn spawn_peer<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(Peer) + Send + 'static,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(PEER_TIMEOUT)).unwrap();
        script(Peer::new(stream));
    });

    (addr, handle)
}

pub fn client_ops(addr: SocketAddr) -> TcpSessionOps {
    TcpSessionOps::connect(addr, Duration::from_secs(2)).unwrap()
}

pub fn client_builder() -> H2ConnectionBuilder {
    H2ConnectionBuilder::new().timeout(Some(Duration::from_secs(2)))
}

pub fn connect(addr: SocketAddr) -> H2Connection<TcpSessionOps> {
    client_builder().connect(client_ops(addr)).unwrap()
}
