use crate::error::{NetworkError, ProtocolError, WireError};
use std::{
    io::{Read, Write},
    net::TcpStream,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Incoming strings larger than this are treated as a protocol violation
/// rather than allocated.
pub const MAX_STRING_LEN: u32 = 64 * 1024 * 1024;

/// Per-call timeout selector.
///
/// `Default` uses the timeout the channel was constructed with; `Never`
/// blocks indefinitely and is reserved for waits where a hang is acceptable
/// (accept-style loops), never for peer reads that must detect a dead peer.
#[derive(Clone, Copy, Debug)]
pub enum Timeout {
    Default,
    Never,
    After(Duration),
}

/// A blocking byte stream the channel can run over. Production uses
/// `SslStream<TcpStream>`; tests drive plain `TcpStream` loopbacks.
pub trait Transport: Read + Write {
    /// Applies a timeout to subsequent read and write calls.
    /// `None` means block indefinitely.
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Human-readable peer description for log context.
    fn peer_desc(&self) -> String;

    /// Orderly shutdown of the stream (and its security layer, if any).
    fn shutdown(&mut self) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn peer_desc(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        }
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl Transport for openssl::ssl::SslStream<TcpStream> {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)?;
        self.get_ref().set_write_timeout(timeout)
    }

    fn peer_desc(&self) -> String {
        match self.get_ref().peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        }
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        // One round is enough: we do not wait for the peer's close_notify.
        openssl::ssl::SslStream::shutdown(self)
            .map(|_| ())
            .map_err(|e| {
                e.into_io_error()
                    .unwrap_or_else(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        self.get_ref().shutdown(std::net::Shutdown::Both)
    }
}

/// An authenticated, ordered byte stream with typed framing primitives.
///
/// Every read/write loops internally until the full unit is moved: callers
/// never observe a torn integer, string or message. All failures are logged
/// with peer context before being returned, and nothing is retried here.
pub struct Channel<T: Transport> {
    transport: T,
    peer: String,
    default_timeout: Duration,
    closed: bool,
}

fn is_timeout_kind(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T, default_timeout: Duration) -> Channel<T> {
        let peer = transport.peer_desc();
        Channel {
            transport,
            peer,
            default_timeout,
            closed: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Resolves a timeout selector into an absolute deadline.
    pub(crate) fn deadline(&self, timeout: Timeout) -> Option<Instant> {
        match timeout {
            Timeout::Default => Some(Instant::now() + self.default_timeout),
            Timeout::Never => None,
            Timeout::After(d) => Some(Instant::now() + d),
        }
    }

    /// Applies the remaining time budget to the transport, failing if the
    /// deadline has already passed.
    fn arm(&mut self, deadline: Option<Instant>) -> Result<(), NetworkError> {
        let remaining = match deadline {
            None => None,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(self.timed_out());
                }
                // Zero would disable the timeout on most platforms.
                Some((d - now).max(Duration::from_millis(1)))
            }
        };
        self.transport
            .set_io_timeout(remaining)
            .map_err(|e| self.io_failed(e))
    }

    fn io_failed(&self, source: std::io::Error) -> NetworkError {
        warn!(peer = %self.peer, error = %source, "channel i/o error");
        NetworkError::Io {
            peer: self.peer.clone(),
            source,
        }
    }

    fn timed_out(&self) -> NetworkError {
        warn!(peer = %self.peer, "channel operation timed out");
        NetworkError::Timeout {
            peer: self.peer.clone(),
            timeout: self.default_timeout,
        }
    }

    fn peer_closed(&self) -> NetworkError {
        warn!(peer = %self.peer, "connection closed by peer");
        NetworkError::Closed {
            peer: self.peer.clone(),
        }
    }

    /// Reads exactly `buf.len()` bytes, honoring one deadline for the whole
    /// call.
    pub fn read_exact(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<(), NetworkError> {
        let deadline = self.deadline(timeout);
        self.read_exact_until(buf, deadline)
    }

    pub(crate) fn read_exact_until(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<(), NetworkError> {
        let mut done = 0;
        while done < buf.len() {
            self.arm(deadline)?;
            match self.transport.read(&mut buf[done..]) {
                Ok(0) => return Err(self.peer_closed()),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_timeout_kind(e) => return Err(self.timed_out()),
                Err(e) => return Err(self.io_failed(e)),
            }
        }
        Ok(())
    }

    /// Writes the whole buffer and flushes, honoring one deadline for the
    /// whole call.
    pub fn write_exact(&mut self, buf: &[u8], timeout: Timeout) -> Result<(), NetworkError> {
        let deadline = self.deadline(timeout);
        self.write_exact_until(buf, deadline)
    }

    fn write_exact_until(
        &mut self,
        buf: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), NetworkError> {
        let mut done = 0;
        while done < buf.len() {
            self.arm(deadline)?;
            match self.transport.write(&buf[done..]) {
                Ok(0) => return Err(self.peer_closed()),
                Ok(n) => done += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_timeout_kind(e) => return Err(self.timed_out()),
                Err(e) => return Err(self.io_failed(e)),
            }
        }
        self.arm(deadline)?;
        match self.transport.flush() {
            Ok(()) => Ok(()),
            Err(ref e) if is_timeout_kind(e) => Err(self.timed_out()),
            Err(e) => Err(self.io_failed(e)),
        }
    }

    pub fn read_u32(&mut self, timeout: Timeout) -> Result<u32, NetworkError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, timeout)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write_u32(&mut self, val: u32, timeout: Timeout) -> Result<(), NetworkError> {
        self.write_exact(&val.to_be_bytes(), timeout)
    }

    pub fn read_i32(&mut self, timeout: Timeout) -> Result<i32, NetworkError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, timeout)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn write_i32(&mut self, val: i32, timeout: Timeout) -> Result<(), NetworkError> {
        self.write_exact(&val.to_be_bytes(), timeout)
    }

    /// Reads a length-prefixed byte string. The bytes are arbitrary: embedded
    /// NULs are legal and no terminator exists on the wire.
    pub fn read_string(&mut self, timeout: Timeout) -> Result<Vec<u8>, WireError> {
        let deadline = self.deadline(timeout);
        let mut len_buf = [0u8; 4];
        self.read_exact_until(&mut len_buf, deadline)?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_STRING_LEN {
            warn!(peer = %self.peer, len, "oversized string announced by peer");
            return Err(ProtocolError::OversizedString(len).into());
        }
        let mut data = vec![0u8; len as usize];
        self.read_exact_until(&mut data, deadline)?;
        Ok(data)
    }

    pub fn write_string(&mut self, data: &[u8], timeout: Timeout) -> Result<(), NetworkError> {
        let deadline = self.deadline(timeout);
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
        framed.extend_from_slice(data);
        self.write_exact_until(&framed, deadline)
    }

    /// Orderly shutdown. Idempotent; failures are logged, never raised.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.transport.shutdown() {
            debug!(peer = %self.peer, error = %err, "shutdown of channel failed");
        }
    }
}

impl<T: Transport> Drop for Channel<T> {
    fn drop(&mut self) {
        self.close();
    }
}
