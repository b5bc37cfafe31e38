//! SETTINGS parameters (RFC 7540 Section 6.5)
//!
//! [`Settings`] is used both for what we advertise and for what the peer
//! advertised. Fields are optional so a frame carries only what was set;
//! the `get_*` accessors supply the protocol defaults.

use super::error::{Error, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::RangeInclusive;

/// Size of one identifier/value pair in a SETTINGS payload
pub const SETTING_ENTRY_SIZE: usize = 6;

/// Legal SETTINGS_MAX_FRAME_SIZE values
pub const MAX_FRAME_SIZE_RANGE: RangeInclusive<u32> = 16384..=16777215;

/// Largest legal SETTINGS_INITIAL_WINDOW_SIZE
pub const MAX_INITIAL_WINDOW_SIZE: u32 = 0x7FFFFFFF;

/// Setting identifiers understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    const ALL: [SettingsParameter; 6] = [
        SettingsParameter::HeaderTableSize,
        SettingsParameter::EnablePush,
        SettingsParameter::MaxConcurrentStreams,
        SettingsParameter::InitialWindowSize,
        SettingsParameter::MaxFrameSize,
        SettingsParameter::MaxHeaderListSize,
    ];

    /// Wire identifier
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Look up a wire identifier; `None` for extensions we do not know
    pub fn from_u16(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_u16() == id)
    }

    /// Name without the `SETTINGS_` prefix
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// A set of SETTINGS values; `None` means "not carried"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    /// `None` is unlimited
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    /// `None` is unlimited
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Settings with nothing set
    pub fn new() -> Self {
        Settings::default()
    }

    /// Settings a probing client advertises unless told otherwise
    pub fn client_defaults() -> Self {
        Settings {
            header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
            enable_push: Some(false),
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            ..Settings::default()
        }
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Check value ranges (RFC 7540 Section 6.5.2)
    pub fn validate(&self) -> Result<()> {
        match self.initial_window_size {
            Some(size) if size > MAX_INITIAL_WINDOW_SIZE => {
                return Err(Error::InvalidSettings(format!(
                    "INITIAL_WINDOW_SIZE {} above 2^31-1",
                    size
                )))
            }
            _ => {}
        }
        match self.max_frame_size {
            Some(size) if !MAX_FRAME_SIZE_RANGE.contains(&size) => Err(Error::InvalidSettings(
                format!("MAX_FRAME_SIZE {} not in 16384..=16777215", size),
            )),
            _ => Ok(()),
        }
    }

    /// Overlay every value carried by `update`
    pub fn merge(&mut self, update: &Settings) {
        self.header_table_size = update.header_table_size.or(self.header_table_size);
        self.enable_push = update.enable_push.or(self.enable_push);
        self.max_concurrent_streams = update.max_concurrent_streams.or(self.max_concurrent_streams);
        self.initial_window_size = update.initial_window_size.or(self.initial_window_size);
        self.max_frame_size = update.max_frame_size.or(self.max_frame_size);
        self.max_header_list_size = update.max_header_list_size.or(self.max_header_list_size);
    }

    fn value(&self, param: SettingsParameter) -> Option<u32> {
        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size,
            SettingsParameter::EnablePush => self.enable_push.map(u32::from),
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => self.initial_window_size,
            SettingsParameter::MaxFrameSize => self.max_frame_size,
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size,
        }
    }

    fn set(&mut self, param: SettingsParameter, value: u32) -> Result<()> {
        let slot = match param {
            SettingsParameter::EnablePush => {
                if value > 1 {
                    return Err(Error::InvalidSettings(format!(
                        "ENABLE_PUSH must be 0 or 1, got {}",
                        value
                    )));
                }
                self.enable_push = Some(value == 1);
                return Ok(());
            }
            SettingsParameter::HeaderTableSize => &mut self.header_table_size,
            SettingsParameter::MaxConcurrentStreams => &mut self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => &mut self.initial_window_size,
            SettingsParameter::MaxFrameSize => &mut self.max_frame_size,
            SettingsParameter::MaxHeaderListSize => &mut self.max_header_list_size,
        };
        *slot = Some(value);
        Ok(())
    }

    /// Carried identifier/value pairs, in identifier order
    pub fn entries(&self) -> Vec<(SettingsParameter, u32)> {
        SettingsParameter::ALL
            .iter()
            .filter_map(|&p| self.value(p).map(|v| (p, v)))
            .collect()
    }

    /// Encode as a SETTINGS frame payload
    pub fn encode(&self) -> Bytes {
        let entries = self.entries();
        let mut buf = BytesMut::with_capacity(entries.len() * SETTING_ENTRY_SIZE);
        for (param, value) in entries {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        }
        buf.freeze()
    }

    /// Decode a SETTINGS frame payload.
    ///
    /// Unknown identifiers are skipped; when an identifier repeats, the
    /// last value wins.
    pub fn decode(payload: &[u8]) -> Result<Settings> {
        if payload.len() % SETTING_ENTRY_SIZE != 0 {
            return Err(Error::Framing(format!(
                "SETTINGS payload of {} bytes is not a whole number of entries",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for entry in payload.chunks_exact(SETTING_ENTRY_SIZE) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match SettingsParameter::from_u16(id) {
                Some(param) => settings.set(param, value)?,
                None => tracing::trace!(id, value, "ignoring unknown setting"),
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

/// Builds a validated [`Settings`]
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Validate and return the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
