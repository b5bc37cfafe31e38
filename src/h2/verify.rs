//! Frame assertions for conformance tests
//!
//! Every check comes in two forms: `check_*` returns a [`Mismatch`]
//! describing the first field that differs, and `verify_*` panics with that
//! description at the caller's location. Error codes are compared
//! numerically, so an unregistered code such as 1111 must match exactly.

use super::error::ErrorCode;
use super::frames::{
    DataFrame, Frame, FrameType, GoawayFrame, HeadersFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use super::headers::HeaderList;
use super::settings::Settings;
use super::stream::StreamId;

/// Server behaviours the receive helpers tolerate.
///
/// Everything is off by default; a strict client reports these as
/// divergences like any other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerQuirks {
    /// Skip one empty DATA frame without END_STREAM sent right after the
    /// response headers
    pub tolerate_leading_empty_data: bool,
}

/// A received frame differs from the expected one
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Mismatch {
    #[error("expected {expected} frame, got {got}")]
    FrameType { expected: FrameType, got: FrameType },

    #[error("expected stream {expected}, got {got}")]
    StreamId { expected: StreamId, got: StreamId },

    #[error("{field}: expected {expected}, got {got}")]
    Field {
        field: &'static str,
        expected: String,
        got: String,
    },

    #[error("malformed {frame_type} frame: {reason}")]
    Malformed { frame_type: FrameType, reason: String },
}

fn field(name: &'static str, expected: impl ToString, got: impl ToString) -> Mismatch {
    Mismatch::Field {
        field: name,
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

fn check_type(frame: &Frame, expected: FrameType) -> Result<(), Mismatch> {
    if frame.frame_type != expected {
        return Err(Mismatch::FrameType {
            expected,
            got: frame.frame_type,
        });
    }
    Ok(())
}

fn check_stream(frame: &Frame, expected: StreamId) -> Result<(), Mismatch> {
    if frame.stream_id != expected {
        return Err(Mismatch::StreamId {
            expected,
            got: frame.stream_id,
        });
    }
    Ok(())
}

fn view<'a, T>(frame: &'a Frame) -> Result<T, Mismatch>
where
    T: TryFrom<&'a Frame, Error = super::error::Error>,
{
    T::try_from(frame).map_err(|e| Mismatch::Malformed {
        frame_type: frame.frame_type,
        reason: e.to_string(),
    })
}

/// DATA on `stream_id` with the given END_STREAM flag and payload length
pub fn check_data_frame(
    frame: &Frame,
    stream_id: StreamId,
    end_stream: bool,
    len: usize,
) -> Result<(), Mismatch> {
    check_type(frame, FrameType::Data)?;
    check_stream(frame, stream_id)?;
    let data: DataFrame = view(frame)?;
    if data.end_stream != end_stream {
        return Err(field("END_STREAM", end_stream, data.end_stream));
    }
    if data.data.len() != len {
        return Err(field("data length", len, data.data.len()));
    }
    Ok(())
}

/// RST_STREAM on `stream_id` carrying exactly `error_code`
pub fn check_reset_frame(
    frame: &Frame,
    stream_id: StreamId,
    error_code: ErrorCode,
) -> Result<(), Mismatch> {
    check_type(frame, FrameType::RstStream)?;
    check_stream(frame, stream_id)?;
    let rst: RstStreamFrame = view(frame)?;
    if rst.error_code != error_code {
        return Err(field("error code", error_code, rst.error_code));
    }
    Ok(())
}

/// HEADERS on `stream_id` with the given END_STREAM flag
pub fn check_headers_frame(frame: &Frame, stream_id: StreamId, end_stream: bool) -> Result<(), Mismatch> {
    check_type(frame, FrameType::Headers)?;
    check_stream(frame, stream_id)?;
    let headers: HeadersFrame = view(frame)?;
    if headers.end_stream != end_stream {
        return Err(field("END_STREAM", end_stream, headers.end_stream));
    }
    Ok(())
}

/// WINDOW_UPDATE on `stream_id`, optionally with an exact increment
pub fn check_window_update_frame(
    frame: &Frame,
    stream_id: StreamId,
    increment: Option<u32>,
) -> Result<(), Mismatch> {
    check_type(frame, FrameType::WindowUpdate)?;
    check_stream(frame, stream_id)?;
    let update: WindowUpdateFrame = view(frame)?;
    match increment {
        Some(expected) if update.size_increment != expected => {
            Err(field("window increment", expected, update.size_increment))
        }
        _ => Ok(()),
    }
}

/// GOAWAY carrying exactly `error_code`
pub fn check_goaway_frame(frame: &Frame, error_code: ErrorCode) -> Result<(), Mismatch> {
    check_type(frame, FrameType::Goaway)?;
    check_stream(frame, 0)?;
    let goaway: GoawayFrame = view(frame)?;
    if goaway.error_code != error_code {
        return Err(field("error code", error_code, goaway.error_code));
    }
    Ok(())
}

/// SETTINGS with the given ACK flag; returns the decoded parameters
pub fn check_settings_frame(frame: &Frame, ack: bool) -> Result<Settings, Mismatch> {
    check_type(frame, FrameType::Settings)?;
    let settings: SettingsFrame = view(frame)?;
    if settings.ack != ack {
        return Err(field("ACK", ack, settings.ack));
    }
    Ok(settings.settings)
}

/// Header list whose `:status` is exactly `status`
pub fn check_status(headers: &HeaderList, status: u16) -> Result<(), Mismatch> {
    let got = headers.get_str(":status").unwrap_or("<missing>");
    if headers.status() != Some(status) {
        return Err(field(":status", status, got));
    }
    Ok(())
}

/// Panic unless `frame` is DATA on `stream_id` with the given flag and length
#[track_caller]
pub fn verify_data_frame(frame: &Frame, stream_id: StreamId, end_stream: bool, len: usize) {
    if let Err(e) = check_data_frame(frame, stream_id, end_stream, len) {
        panic!("{} ({})", e, frame);
    }
}

/// Panic unless `frame` is RST_STREAM on `stream_id` with `error_code`
#[track_caller]
pub fn verify_reset_frame(frame: &Frame, stream_id: StreamId, error_code: ErrorCode) {
    if let Err(e) = check_reset_frame(frame, stream_id, error_code) {
        panic!("{} ({})", e, frame);
    }
}

#[track_caller]
pub fn verify_headers_frame(frame: &Frame, stream_id: StreamId, end_stream: bool) {
    if let Err(e) = check_headers_frame(frame, stream_id, end_stream) {
        panic!("{} ({})", e, frame);
    }
}

#[track_caller]
pub fn verify_window_update_frame(frame: &Frame, stream_id: StreamId, increment: Option<u32>) {
    if let Err(e) = check_window_update_frame(frame, stream_id, increment) {
        panic!("{} ({})", e, frame);
    }
}

#[track_caller]
pub fn verify_goaway_frame(frame: &Frame, error_code: ErrorCode) {
    if let Err(e) = check_goaway_frame(frame, error_code) {
        panic!("{} ({})", e, frame);
    }
}

#[track_caller]
pub fn verify_settings_frame(frame: &Frame, ack: bool) -> Settings {
    match check_settings_frame(frame, ack) {
        Ok(settings) => settings,
        Err(e) => panic!("{} ({})", e, frame),
    }
}

#[track_caller]
pub fn verify_status(headers: &HeaderList, status: u16) {
    if let Err(e) = check_status(headers, status) {
        panic!("{}", e);
    }
}
