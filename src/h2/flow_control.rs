//! Window accounting for DATA frames (RFC 7540 Section 5.2, 6.9)
//!
//! The connection and every stream each own a [`FlowControl`]. Nothing here
//! blocks: a send that does not fit is refused and the caller decides when
//! to retry.

use super::error::{Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Largest legal window size (2^31 - 1)
pub const MAX_WINDOW_SIZE: i64 = 0x7FFFFFFF;

/// One direction of a flow-control window.
///
/// The level is signed: lowering SETTINGS_INITIAL_WINDOW_SIZE while data is
/// in flight can leave it negative (RFC 7540 Section 6.9.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    initial: u32,
    level: i64,
}

impl Window {
    pub fn new(initial: u32) -> Self {
        Window {
            initial,
            level: i64::from(initial),
        }
    }

    /// Current level, possibly negative
    pub fn size(&self) -> i64 {
        self.level
    }

    /// Bytes that fit right now
    pub fn available(&self) -> usize {
        usize::try_from(self.level).unwrap_or(0)
    }

    pub fn initial_size(&self) -> u32 {
        self.initial
    }

    /// Take `amount` bytes, or refuse and leave the level untouched
    pub fn consume(&mut self, amount: usize) -> Result<()> {
        if amount > self.available() {
            return Err(Error::FlowControl(format!(
                "{} bytes exceed window of {}",
                amount, self.level
            )));
        }
        self.level -= amount as i64;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment and return the new level
    pub fn credit(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("WINDOW_UPDATE with zero increment".to_string()));
        }
        let level = self.level + i64::from(increment);
        if level > MAX_WINDOW_SIZE {
            return Err(Error::Protocol(format!(
                "window would grow to {}, past 2^31-1",
                level
            )));
        }
        self.level = level;
        Ok(level)
    }

    /// Move the window to a new initial size, shifting the level by the
    /// same delta
    pub fn resize(&mut self, initial: u32) -> Result<()> {
        let level = self.level + i64::from(initial) - i64::from(self.initial);
        if level > MAX_WINDOW_SIZE {
            return Err(Error::Protocol(format!(
                "resizing to {} grows window to {}, past 2^31-1",
                initial, level
            )));
        }
        self.initial = initial;
        self.level = level;
        Ok(())
    }
}

impl Default for Window {
    fn default() -> Self {
        Window::new(DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

/// The pair of windows owned by the connection or by one stream
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    send: Window,
    recv: Window,
}

impl FlowControl {
    pub fn new() -> Self {
        FlowControl::default()
    }

    pub fn with_initial_sizes(send: u32, recv: u32) -> Self {
        FlowControl {
            send: Window::new(send),
            recv: Window::new(recv),
        }
    }

    /// What the peer allows us to send
    pub fn send_window(&self) -> &Window {
        &self.send
    }

    pub fn send_window_mut(&mut self) -> &mut Window {
        &mut self.send
    }

    /// What we allow the peer to send
    pub fn recv_window(&self) -> &Window {
        &self.recv
    }

    pub fn recv_window_mut(&mut self) -> &mut Window {
        &mut self.recv
    }

    pub fn can_send(&self, amount: usize) -> bool {
        amount <= self.send.available()
    }

    pub fn consume_send_window(&mut self, amount: usize) -> Result<()> {
        self.send.consume(amount)
    }

    /// Peer granted more send capacity
    pub fn increase_send_window(&mut self, increment: u32) -> Result<i64> {
        self.send.credit(increment)
    }

    /// Account for inbound flow-controlled bytes; an overrun is a
    /// protocol violation by the peer
    pub fn consume_recv_window(&mut self, amount: usize) -> Result<()> {
        self.recv.level -= amount as i64;
        if self.recv.level < 0 {
            return Err(Error::Protocol(format!(
                "peer overran receive window by {} bytes",
                -self.recv.level
            )));
        }
        Ok(())
    }

    /// Increment that refills the receive window, once it has dropped
    /// below half of its initial size
    pub fn should_send_window_update(&self) -> Option<u32> {
        let initial = i64::from(self.recv.initial);
        (self.recv.level < initial / 2).then(|| (initial - self.recv.level) as u32)
    }

    /// We granted the peer more capacity
    pub fn send_window_update(&mut self, increment: u32) -> Result<i64> {
        self.recv.credit(increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_all_or_nothing() {
        let mut window = Window::new(100);
        window.consume(70).unwrap();
        assert!(matches!(window.consume(31), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), 30);

        window.consume(30).unwrap();
        window.consume(0).unwrap();
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_default_window_holds_three_full_frames() {
        let mut flow = FlowControl::new();
        for _ in 0..3 {
            flow.consume_send_window(16384).unwrap();
        }
        assert_eq!(flow.send_window().size(), 16383);
        assert!(flow.consume_send_window(16384).is_err());

        assert_eq!(flow.increase_send_window(49152).unwrap(), 65535);
        assert!(flow.can_send(16384));
    }

    #[test]
    fn test_credit_limits() {
        let mut window = Window::new(10);
        assert_eq!(window.credit(5).unwrap(), 15);
        assert!(window.credit(0).is_err());

        let mut full = Window::new(0x7FFFFFFF);
        assert!(full.credit(1).is_err());
        assert_eq!(full.size(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn test_resize_shifts_level() {
        let mut window = Window::new(1000);
        window.consume(400).unwrap();

        window.resize(2000).unwrap();
        assert_eq!((window.initial_size(), window.size()), (2000, 1600));

        window.resize(100).unwrap();
        assert_eq!(window.size(), -300);
        assert_eq!(window.available(), 0);

        let mut flow = FlowControl::with_initial_sizes(100, 100);
        *flow.send_window_mut() = window;
        assert!(!flow.can_send(1));
        assert!(flow.increase_send_window(300).is_ok());
        assert!(flow.can_send(0));
        assert!(!flow.can_send(1));
    }

    #[test]
    fn test_recv_overrun_is_protocol_error() {
        let mut flow = FlowControl::with_initial_sizes(65535, 10);
        flow.consume_recv_window(10).unwrap();
        assert!(matches!(flow.consume_recv_window(1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_window_update_threshold() {
        let mut flow = FlowControl::with_initial_sizes(1000, 1000);
        flow.consume_recv_window(500).unwrap();
        assert_eq!(flow.should_send_window_update(), None);

        flow.consume_recv_window(1).unwrap();
        assert_eq!(flow.should_send_window_update(), Some(501));

        flow.send_window_update(501).unwrap();
        assert_eq!(flow.recv_window().size(), 1000);
        assert_eq!(flow.should_send_window_update(), None);
    }
}
