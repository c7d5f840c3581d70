//! Datagram sources: one datagram in, one line out.

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::source::{DATAGRAM_MAX, Line};

/// Strip the conventional trailing newline; the datagram itself is the
/// frame, so at most one terminator is removed.
fn datagram_line(payload: &[u8]) -> Line {
    let trimmed = match payload.last() {
        Some(&b'\n') => &payload[..payload.len() - 1],
        _ => payload,
    };
    trimmed.to_vec()
}

/// A UDP socket receiving one log line per datagram.
#[derive(Debug)]
pub struct UdpSource {
    host: Option<String>,
    port: u16,
    socket: Option<UdpSocket>,
    closed: bool,
    warned: bool,
}

impl UdpSource {
    /// Listen on `host:port`; `None` or an empty host means all interfaces.
    pub fn new(host: Option<String>, port: u16) -> UdpSource {
        UdpSource {
            host: host.filter(|host| !host.is_empty()),
            port,
            socket: None,
            closed: false,
            warned: false,
        }
    }

    /// Bind the socket. A failed bind (address in use, denied) leaves the
    /// source unopened and is retried by the engine on the next tick.
    pub fn open(&mut self) {
        if self.closed || self.socket.is_some() {
            return;
        }
        let addr = (self.host.as_deref().unwrap_or("0.0.0.0"), self.port);
        let bound = UdpSocket::bind(addr).and_then(|socket| {
            socket.set_nonblocking(true)?;
            Ok(socket)
        });
        match bound {
            Ok(socket) => {
                self.socket = Some(socket);
                self.warned = false;
            }
            Err(err) => {
                if self.warned {
                    debug!("still cannot bind {}: {}", self, err);
                } else {
                    warn!("cannot bind {}: {}", self, err);
                    self.warned = true;
                }
            }
        }
    }

    /// The address actually bound (useful when the configured port is 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub(crate) fn close(&mut self) {
        self.socket = None;
        self.closed = true;
    }

    pub(crate) fn fileno(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|socket| socket.as_raw_fd())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn next_line(&mut self) -> io::Result<Option<Line>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        let mut buffer = [0u8; DATAGRAM_MAX];
        match socket.recv_from(&mut buffer) {
            Ok((received, _peer)) => Ok(Some(datagram_line(&buffer[..received]))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for UdpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "udp:{}:{}",
            self.host.as_deref().unwrap_or("*"),
            self.port
        )
    }
}

/// A unix datagram socket receiving one log line per datagram.
#[derive(Debug)]
pub struct UnixSource {
    path: PathBuf,
    socket: Option<UnixDatagram>,
    closed: bool,
    warned: bool,
}

impl UnixSource {
    /// Listen on the unix datagram socket at `path`.
    pub fn new(path: &Path) -> UnixSource {
        UnixSource {
            path: path.to_owned(),
            socket: None,
            closed: false,
            warned: false,
        }
    }

    /// Bind the socket; see [`UdpSource::open`] for the failure policy.
    pub fn open(&mut self) {
        if self.closed || self.socket.is_some() {
            return;
        }
        let bound = UnixDatagram::bind(&self.path).and_then(|socket| {
            socket.set_nonblocking(true)?;
            Ok(socket)
        });
        match bound {
            Ok(socket) => {
                self.socket = Some(socket);
                self.warned = false;
            }
            Err(err) => {
                if self.warned {
                    debug!("still cannot bind {}: {}", self, err);
                } else {
                    warn!("cannot bind {}: {}", self, err);
                    self.warned = true;
                }
            }
        }
    }

    pub(crate) fn close(&mut self) {
        // The socket node stays in the filesystem after the descriptor is
        // gone; remove it so the next bind succeeds.
        if self.socket.take().is_some() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                debug!("cannot unlink {}: {}", self, err);
            }
        }
        self.closed = true;
    }

    pub(crate) fn fileno(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|socket| socket.as_raw_fd())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn next_line(&mut self) -> io::Result<Option<Line>> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(None);
        };
        let mut buffer = [0u8; DATAGRAM_MAX];
        match socket.recv_from(&mut buffer) {
            Ok((received, _peer)) => Ok(Some(datagram_line(&buffer[..received]))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Display for UnixSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unix:{}", self.path.display())
    }
}
