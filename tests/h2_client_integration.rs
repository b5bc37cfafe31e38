//! HTTP/2 client integration tests
//!
//! Each test runs a scripted peer on a local TCP socket and drives the
//! client engine against it:
//! - Preface and SETTINGS exchange
//! - Request/response cycles with bodies, 1xx responses and trailers
//! - CONTINUATION reassembly
//! - RST_STREAM and GOAWAY handling
//! - Flow control and timeouts

mod common;

use bytes::Bytes;
use common::*;
use h2probe::h2::verify::*;
use h2probe::h2::*;
use std::time::Duration;

fn get(path: &str) -> HeaderList {
    HeaderList::request("GET", "http", "localhost", path)
}

#[test]
fn test_handshake_exchanges_settings() {
    let (addr, server) = spawn_peer(|mut peer| {
        let client = peer.handshake(
            SettingsBuilder::new()
                .max_concurrent_streams(100)
                .max_frame_size(32768)
                .build()
                .unwrap(),
        );
        assert_eq!(client.enable_push, Some(false));
        assert_eq!(client.initial_window_size, Some(65535));
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    assert_eq!(conn.state(), ConnectionState::Active);
    assert_eq!(conn.remote_settings().get_max_concurrent_streams(), Some(100));
    assert_eq!(conn.remote_settings().get_max_frame_size(), 32768);

    conn.close().unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.join().unwrap();
}

#[test]
fn test_handshake_rejects_non_settings_first_frame() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.read_preface();
        peer.send(&PingFrame::new([1; 8]).to_frame());
        peer.wait_closed();
    });

    let result = client_builder().connect(client_ops(addr));
    assert!(matches!(result, Err(Error::Handshake(_))));
    server.join().unwrap();
}

#[test]
fn test_get_with_empty_end_stream_data() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());

        let request = peer.read_frame();
        verify_headers_frame(&request, 1, true);
        let fields = peer.decode_headers(&request);
        assert_eq!(fields[0], (":method".to_string(), "GET".to_string()));
        assert!(fields.contains(&(":path".to_string(), "/foo".to_string())));

        peer.send_headers(1, &[(":status", "200")], false);
        peer.send(&DataFrame::new(1, Bytes::new(), true).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/foo"), true).unwrap();
    assert_eq!(stream_id, 1);

    let block = conn.receive_headers(stream_id).unwrap();
    assert_eq!(block.kind, HeaderBlockKind::Response);
    verify_status(&block.fields, 200);

    let data = conn.receive_data_frame(stream_id).unwrap();
    verify_data_frame(&data.to_frame(), 1, true, 0);
    assert_eq!(conn.stream_state(stream_id), Some(StreamState::Closed));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_post_body() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());

        let request = peer.read_frame();
        verify_headers_frame(&request, 1, false);

        let body = peer.read_frame();
        verify_data_frame(&body, 1, true, 11);
        assert_eq!(&body.payload[..], b"Hello World");

        peer.send_headers(1, &[(":status", "200"), ("content-length", "0")], true);
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let headers = HeaderList::request("POST", "http", "localhost", "/echo")
        .with("content-type", "text/plain");
    let response = conn.request(&headers, Some(&b"Hello World"[..])).unwrap();

    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
    assert_eq!(response.headers.get_str("content-length"), Some("0"));
    assert_eq!(conn.send_window(), 65535 - 11);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_echo_with_leading_empty_data_quirk() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        let body = peer.read_frame();

        peer.send_headers(1, &[(":status", "200")], false);
        peer.send(&DataFrame::new(1, Bytes::new(), false).to_frame());
        peer.send(&DataFrame::new(1, body.payload, true).to_frame());
        peer.wait_closed();
    });

    let mut conn = client_builder()
        .quirks(ServerQuirks {
            tolerate_leading_empty_data: true,
        })
        .connect(client_ops(addr))
        .unwrap();
    let headers = HeaderList::request("POST", "http", "localhost", "/echo");
    let stream_id = conn.start_stream(&headers, false).unwrap();
    conn.send_data(stream_id, b"Hello World", true).unwrap();

    verify_status(&conn.receive_headers(stream_id).unwrap().fields, 200);
    let data = conn.receive_data_frame(stream_id).unwrap();
    verify_data_frame(&data.to_frame(), stream_id, true, 11);
    assert_eq!(&data.data[..], b"Hello World");

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_leading_empty_data_is_reported_when_strict() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();

        peer.send_headers(1, &[(":status", "200")], false);
        peer.send(&DataFrame::new(1, Bytes::new(), false).to_frame());
        peer.send(&DataFrame::new(1, Bytes::new(), true).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/foo"), true).unwrap();
    conn.receive_headers(stream_id).unwrap();

    let first = conn.receive_data_frame(stream_id).unwrap();
    assert!(check_data_frame(&first.to_frame(), stream_id, true, 0).is_err());
    let second = conn.receive_data_frame(stream_id).unwrap();
    verify_data_frame(&second.to_frame(), stream_id, true, 0);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_client_reset_carries_exact_code() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();

        peer.send_headers(1, &[(":status", "200")], false);
        peer.send(&DataFrame::new(1, Bytes::from_static(b"partial"), false).to_frame());

        let rst = peer.read_frame();
        verify_reset_frame(&rst, 1, ErrorCode(1111));
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/slow"), true).unwrap();
    verify_status(&conn.receive_headers(stream_id).unwrap().fields, 200);
    assert_eq!(&conn.receive_data_frame(stream_id).unwrap().data[..], b"partial");

    conn.reset_stream(stream_id, ErrorCode(1111)).unwrap();
    assert_eq!(conn.stream_state(stream_id), Some(StreamState::Closed));
    assert!(matches!(
        conn.reset_stream(stream_id, ErrorCode(1111)),
        Err(Error::StreamClosed(1))
    ));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_peer_reset_surfaces_code() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        peer.send(&RstStreamFrame::new(1, ErrorCode::REFUSED_STREAM).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/"), true).unwrap();
    let err = conn.receive_response(stream_id).unwrap_err();
    assert!(matches!(
        err,
        Error::StreamReset {
            stream_id: 1,
            error_code: ErrorCode::REFUSED_STREAM
        }
    ));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_headers_with_continuation() {
    let value = "x".repeat(100);
    let fields = [
        (":status", "200"),
        ("x-first", value.as_str()),
        ("x-second", value.as_str()),
        ("x-third", value.as_str()),
    ];
    let expected: HeaderList = fields.iter().copied().collect();

    let (addr, server) = spawn_peer(move |mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        peer.read_frame();

        let value = "x".repeat(100);
        let fields = [
            (":status", "200"),
            ("x-first", value.as_str()),
            ("x-second", value.as_str()),
            ("x-third", value.as_str()),
        ];
        // HEADERS + 2 CONTINUATION, then the same list in a single frame
        peer.send_headers_split(1, &fields, true, 3);
        peer.send_headers_split(3, &fields, true, 1);
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let split = conn.start_stream(&get("/big-headers"), true).unwrap();
    let whole = conn.start_stream(&get("/big-headers"), true).unwrap();

    let reassembled = conn.receive_response(split).unwrap();
    let single = conn.receive_response(whole).unwrap();

    assert_eq!(reassembled.status, 200);
    assert_eq!(reassembled.headers, expected);
    assert_eq!(reassembled.headers, single.headers);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_informational_and_trailers() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();

        peer.send_headers(1, &[(":status", "100")], false);
        peer.send_headers(1, &[(":status", "200"), ("trailer", "grpc-status")], false);
        peer.send(&DataFrame::new(1, Bytes::from_static(b"body"), false).to_frame());
        peer.send_headers(1, &[("grpc-status", "0")], true);
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/grpc"), true).unwrap();
    let response = conn.receive_response(stream_id).unwrap();

    assert_eq!(response.informational.len(), 1);
    verify_status(&response.informational[0], 100);
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"body");
    let trailers = response.trailers.unwrap();
    assert_eq!(trailers.get_str("grpc-status"), Some("0"));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_responses_out_of_order() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        verify_headers_frame(&peer.read_frame(), 1, true);
        verify_headers_frame(&peer.read_frame(), 3, true);

        peer.send_headers(3, &[(":status", "404")], true);
        peer.send_headers(1, &[(":status", "200")], true);
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let first = conn.start_stream(&get("/a"), true).unwrap();
    let second = conn.start_stream(&get("/b"), true).unwrap();
    assert_eq!((first, second), (1, 3));

    assert_eq!(conn.receive_response(first).unwrap().status, 200);
    assert_eq!(conn.receive_response(second).unwrap().status, 404);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_interleaved_bodies_reach_their_streams() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        verify_headers_frame(&peer.read_frame(), 1, true);
        verify_headers_frame(&peer.read_frame(), 3, true);

        peer.send_headers(3, &[(":status", "200")], false);
        peer.send(&DataFrame::new(3, Bytes::from_static(b"thr"), false).to_frame());
        peer.send_headers(1, &[(":status", "200")], false);
        peer.send(&DataFrame::new(3, Bytes::from_static(b"ee"), true).to_frame());
        peer.send(&DataFrame::new(1, Bytes::from_static(b"one"), true).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let first = conn.start_stream(&get("/one"), true).unwrap();
    let second = conn.start_stream(&get("/three"), true).unwrap();

    let response = conn.receive_response(first).unwrap();
    assert_eq!(&response.body[..], b"one");
    assert_eq!(conn.stream_state(second), Some(StreamState::Closed));

    let response = conn.receive_response(second).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"three");
    assert!(matches!(conn.receive_data_frame(second), Err(Error::StreamClosed(3))));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_held_data_is_returned_frame_by_frame() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        peer.read_frame();

        peer.send_headers(1, &[(":status", "200")], false);
        peer.send_headers(3, &[(":status", "200")], false);
        peer.send(&DataFrame::new(3, Bytes::from_static(b"early"), false).to_frame());
        peer.send(&DataFrame::new(1, Bytes::new(), true).to_frame());
        peer.send(&DataFrame::new(3, Bytes::from_static(b"late"), true).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let first = conn.start_stream(&get("/"), true).unwrap();
    let second = conn.start_stream(&get("/"), true).unwrap();

    conn.receive_headers(first).unwrap();
    verify_data_frame(&conn.receive_data_frame(first).unwrap().to_frame(), first, true, 0);

    conn.receive_headers(second).unwrap();
    let early = conn.receive_data_frame(second).unwrap();
    verify_data_frame(&early.to_frame(), second, false, 5);
    let late = conn.receive_data_frame(second).unwrap();
    assert_eq!(&late.data[..], b"late");

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_data_before_headers_is_protocol_error() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        peer.send(&DataFrame::new(1, Bytes::from_static(b"oops"), true).to_frame());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/"), true).unwrap();
    assert!(matches!(conn.receive_headers(stream_id), Err(Error::Protocol(_))));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_goaway_closes_connection() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
        peer.send(
            &GoawayFrame::new(0, ErrorCode::ENHANCE_YOUR_CALM, Bytes::from_static(b"slow down"))
                .to_frame(),
        );
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/"), true).unwrap();

    assert!(matches!(conn.receive_headers(stream_id), Err(Error::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closing);
    let goaway = conn.peer_goaway().unwrap();
    assert_eq!(goaway.error_code, ErrorCode::ENHANCE_YOUR_CALM);
    assert_eq!(&goaway.debug_data[..], b"slow down");

    assert!(matches!(conn.start_stream(&get("/"), true), Err(Error::ConnectionClosed)));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_transport_close_reports_connection_closed() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/"), true).unwrap();
    server.join().unwrap();

    assert!(matches!(conn.receive_headers(stream_id), Err(Error::ConnectionClosed)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(conn.receive_frame(), Err(Error::ConnectionClosed)));
}

#[test]
fn test_receive_timeout() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let err = conn
        .receive_frame_within(Duration::from_millis(100))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(conn.state(), ConnectionState::Active);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_flow_control_would_block_then_resume() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(SettingsBuilder::new().initial_window_size(16).build().unwrap());
        verify_headers_frame(&peer.read_frame(), 1, false);
        verify_data_frame(&peer.read_frame(), 1, false, 16);

        peer.send(&WindowUpdateFrame::new(1, 1024).to_frame());
        verify_data_frame(&peer.read_frame(), 1, true, 24);

        peer.send_headers(1, &[(":status", "204")], true);
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let headers = HeaderList::request("PUT", "http", "localhost", "/upload");
    let stream_id = conn.start_stream(&headers, false).unwrap();

    let body = [7u8; 40];
    let sent = match conn.send_data(stream_id, &body, true) {
        Err(Error::WouldBlock { stream_id: 1, sent }) => sent,
        other => panic!("expected WouldBlock, got {:?}", other),
    };
    assert_eq!(sent, 16);

    let update = conn.receive_frame().unwrap();
    verify_window_update_frame(&update, 1, Some(1024));

    conn.send_data(stream_id, &body[sent..], true).unwrap();
    assert_eq!(conn.stream_send_window(stream_id), Some(16 + 1024 - 40));

    assert_eq!(conn.receive_response(stream_id).unwrap().status, 204);

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_ping_is_acknowledged() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.send(&PingFrame::new(*b"12345678").to_frame());

        let ack = peer.read_frame();
        assert_eq!(PingFrame::try_from(&ack).unwrap(), PingFrame::ack(*b"12345678"));
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let ping = conn.receive_frame().unwrap();
    assert_eq!(ping.frame_type, FrameType::Ping);
    assert!(!ping.is_ack());

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_raw_frames_pass_through() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());

        let unknown = peer.read_frame();
        assert_eq!(unknown.frame_type, FrameType::Unknown(0xfa));
        assert_eq!(unknown.flags.as_u8(), 0xff);
        assert_eq!(&unknown.payload[..], b"opaque");

        let priority = peer.read_frame();
        assert_eq!(
            PriorityFrame::try_from(&priority).unwrap().priority,
            PrioritySpec::new(0, true, 255)
        );
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    conn.send_frame(&Frame::new(
        FrameType::Unknown(0xfa),
        FrameFlags::from_u8(0xff),
        0,
        Bytes::from_static(b"opaque"),
    ))
    .unwrap();
    conn.send_frame(
        &PriorityFrame {
            stream_id: 5,
            priority: PrioritySpec::new(0, true, 255),
        }
        .to_frame(),
    )
    .unwrap();

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_push_promise_reserves_stream() {
    let (addr, server) = spawn_peer(|mut peer| {
        let client = peer.handshake(Settings::new());
        assert_eq!(client.enable_push, Some(true));
        peer.read_frame();

        let block = peer.encode(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":authority", "localhost"),
            (":path", "/style.css"),
        ]);
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&block);
        peer.send(&Frame::new(
            FrameType::PushPromise,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            1,
            Bytes::from(payload),
        ));

        peer.send_headers(1, &[(":status", "200")], true);
        peer.send_headers(2, &[(":status", "200"), ("content-type", "text/css")], true);
        peer.wait_closed();
    });

    let mut conn = client_builder()
        .enable_push(true)
        .connect(client_ops(addr))
        .unwrap();
    let stream_id = conn.start_stream(&get("/"), true).unwrap();
    assert_eq!(conn.receive_response(stream_id).unwrap().status, 200);

    assert_eq!(conn.stream_state(2), Some(StreamState::ReservedRemote));
    let promise = conn.receive_headers(2).unwrap();
    assert_eq!(promise.kind, HeaderBlockKind::PushPromise);
    assert_eq!(promise.fields.get_str(":path"), Some("/style.css"));

    let pushed = conn.receive_response(2).unwrap();
    assert_eq!(pushed.headers.get_str("content-type"), Some("text/css"));

    conn.close().unwrap();
    server.join().unwrap();
}

#[test]
fn test_push_promise_rejected_when_disabled() {
    let (addr, server) = spawn_peer(|mut peer| {
        peer.handshake(Settings::new());
        peer.read_frame();

        let block = peer.encode(&[(":method", "GET"), (":path", "/pushed")]);
        let mut payload = 2u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&block);
        peer.send(&Frame::new(
            FrameType::PushPromise,
            FrameFlags::from_u8(FrameFlags::END_HEADERS),
            1,
            Bytes::from(payload),
        ));
        peer.wait_closed();
    });

    let mut conn = connect(addr);
    let stream_id = conn.start_stream(&get("/"), true).unwrap();
    assert!(matches!(conn.receive_headers(stream_id), Err(Error::Protocol(_))));

    conn.close().unwrap();
    server.join().unwrap();
}
