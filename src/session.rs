//! Session operations abstraction
//!
//! The engine only ever reads and writes octets. This module provides the
//! session operations pattern that lets the same engine run over plain TCP,
//! TLS (see [`crate::tls`]) or any other duplex byte stream.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("ALPN negotiation failed: expected h2, got {0:?}")]
    AlpnFailed(Option<Vec<u8>>),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Session operations trait
///
/// Abstracts over plain TCP and TLS connections.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush buffered output
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

/// Session wrapping a transport with deadline-aware I/O
pub struct Session<S: SessionOps> {
    ops: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> Session<S> {
    /// Create a new session with a 10 second default timeout
    pub fn new(ops: S) -> Self {
        Session {
            ops,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the default timeout for operations (`None` waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the default timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deadline for an operation starting now
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    /// Read whatever is available, waiting until `deadline` at most.
    ///
    /// Returns `Error::ConnectionClosed` on end of stream.
    pub fn read_until(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        let remaining = remaining(deadline)?;
        if !self.ops.poll(PollEvents::Read, remaining)? {
            return Err(Error::Timeout);
        }

        match self.ops.read(buf) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(Error::Io(e)) if is_reset(&e) => Err(Error::ConnectionClosed),
            Err(e) => Err(e),
        }
    }

    /// Write the whole buffer, using the default timeout for each chunk
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        let deadline = self.deadline();
        while !buf.is_empty() {
            let remaining = remaining(deadline)?;
            if !self.ops.poll(PollEvents::Write, remaining)? {
                return Err(Error::Timeout);
            }

            match self.ops.write(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => buf = &buf[n..],
                Err(Error::Io(e)) if is_reset(&e) => return Err(Error::ConnectionClosed),
                Err(e) => return Err(e),
            }
        }
        self.ops.flush()
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.ops.close()
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.ops
    }

    /// Get a mutable reference to the underlying session
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.ops
    }
}

fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(Error::Timeout)
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// Wait for readiness on a raw descriptor.
///
/// A wait cut short by a signal is resumed with the time that remains, so
/// `Ok(false)` always means the timeout expired.
pub(crate) fn poll_fd(fd: i32, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let deadline = timeout.map(|d| Instant::now() + d);
    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
            PollEvents::Both => POLLIN | POLLOUT,
        },
        revents: 0,
    };

    loop {
        let timeout_ms = poll_timeout_ms(deadline);
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result >= 0 {
            return Ok(result > 0);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}

/// Milliseconds left before `deadline`, rounded up (-1 = infinite)
fn poll_timeout_ms(deadline: Option<Instant>) -> i32 {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            left.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32
        }
    }
}

/// Open a TCP connection with TCP_NODELAY set, bounded by `timeout`
pub fn tcp_connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&addr.into(), timeout).map_err(|e| {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(e)
        }
    })?;
    Ok(socket.into())
}

/// Plain TCP session operations
pub struct TcpSessionOps {
    stream: TcpStream,
}

impl TcpSessionOps {
    /// Create session operations from a connected TCP stream
    pub fn new(stream: TcpStream) -> Self {
        TcpSessionOps { stream }
    }

    /// Connect to `addr` (TCP_NODELAY, bounded connect)
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        Ok(TcpSessionOps::new(tcp_connect(addr, timeout)?))
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for TcpSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
