//! Blocking framed transport
//!
//! One request in flight at a time: callers send a full message and,
//! for queries and get-mores, read exactly one reply back.

use crate::network::protocol::{HEADER_LEN, MAX_REPLY_SIZE, MsgHeader, Reply};
use crate::{DocWireError, DocWireResult};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Stream kinds the client can speak over.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// Represents a network connection
#[derive(Debug)]
pub struct NetworkConnection {
    stream: Transport,
    peer: String,
    last_activity: Instant,
}

impl NetworkConnection {
    pub fn new(stream: Transport, peer: String) -> Self {
        Self {
            stream,
            peer,
            last_activity: Instant::now(),
        }
    }

    pub fn connect_tcp(
        host: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> DocWireResult<Self> {
        let peer = format!("{}:{}", host, port);
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| DocWireError::Connection(format!("cannot resolve {}: {}", peer, e)))?;

        let mut last_error = None;
        for addr in addrs {
            let attempt = match connect_timeout {
                Some(timeout) if !timeout.is_zero() => TcpStream::connect_timeout(&addr, timeout),
                _ => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("connected to {}", peer);
                    return Ok(Self::new(Transport::Tcp(stream), peer));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(DocWireError::Connection(match last_error {
            Some(e) => format!("failed to connect to {}: {}", peer, e),
            None => format!("no addresses for {}", peer),
        }))
    }

    #[cfg(unix)]
    pub fn connect_unix(path: &Path) -> DocWireResult<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            DocWireError::Connection(format!("failed to connect to {}: {}", path.display(), e))
        })?;
        debug!("connected to {}", path.display());
        Ok(Self::new(
            Transport::Unix(stream),
            path.display().to_string(),
        ))
    }

    /// Applies one timeout to both directions; `None` blocks forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> DocWireResult<()> {
        let timeout = timeout.filter(|t| !t.is_zero());
        self.stream.set_timeouts(timeout).map_err(DocWireError::Io)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Send a complete message through the connection
    pub fn send(&mut self, message: &[u8]) -> DocWireResult<()> {
        self.stream
            .write_all(message)
            .map_err(DocWireError::from_io)?;
        self.stream.flush().map_err(DocWireError::from_io)?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Read one reply message
    pub fn read_reply(&mut self) -> DocWireResult<Reply> {
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .map_err(DocWireError::from_io)?;
        let header = MsgHeader::decode(&header)?;

        let len = usize::try_from(header.len).map_err(|_| DocWireError::ReadSize(0))?;
        Reply::check_size(len)?;
        let body_len = header.body_len(MAX_REPLY_SIZE)?;

        let mut body = vec![0u8; body_len];
        self.stream
            .read_exact(&mut body)
            .map_err(DocWireError::from_io)?;
        self.last_activity = Instant::now();

        Reply::parse(header, Bytes::from(body))
    }

    pub fn shutdown(&mut self) {
        debug!("closing connection to {}", self.peer);
        self.stream.shutdown();
    }
}
