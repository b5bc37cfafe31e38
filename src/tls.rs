//! TLS transport with ALPN "h2"
//!
//! Implements [`SessionOps`] over an OpenSSL stream so the engine can talk to
//! a server that only offers HTTP/2 over TLS. The engine itself never looks
//! at TLS; this module only hands it a negotiated byte stream.

use crate::session::{self, poll_fd, Error, PollEvents, Result, SessionOps};
use openssl::ssl::{SslConnector, SslMethod, SslStream, SslVerifyMode};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// ALPN protocol identifier for HTTP/2 over TLS
pub const ALPN_H2: &[u8] = b"h2";

/// Encode protocol names into the length-prefixed ALPN wire format
pub fn alpn_wire_format(protocols: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for proto in protocols {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto);
    }
    out
}

/// Client TLS options
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// SNI server name (also used for verification)
    pub servername: String,
    /// Verify the server certificate chain
    pub verify_peer: bool,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl TlsOptions {
    /// Options for a test server: no certificate verification
    pub fn new(servername: impl Into<String>) -> Self {
        TlsOptions {
            servername: servername.into(),
            verify_peer: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }
}

/// TLS session operations
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Connect over TCP, run the TLS handshake offering only `h2`, and
    /// require the server to select it.
    pub fn connect(addr: SocketAddr, options: &TlsOptions) -> Result<Self> {
        let tcp = session::tcp_connect(addr, options.connect_timeout)?;

        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_alpn_protos(&alpn_wire_format(&[ALPN_H2]))?;
        if !options.verify_peer {
            builder.set_verify(SslVerifyMode::NONE);
        }
        let connector = builder.build();

        let mut config = connector.configure()?;
        config.set_verify_hostname(options.verify_peer);

        let stream = config
            .connect(&options.servername, tcp)
            .map_err(|e| Error::TlsHandshake(e.to_string()))?;

        let selected = stream.ssl().selected_alpn_protocol();
        if selected != Some(ALPN_H2) {
            return Err(Error::AlpnFailed(selected.map(|p| p.to_vec())));
        }

        tracing::debug!(server = %options.servername, "TLS established, ALPN h2");

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        // Decrypted bytes already buffered inside OpenSSL never show up on the fd
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }
        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> Result<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }
        let _ = self.stream.get_mut().shutdown(Shutdown::Both);
        Ok(())
    }
}
