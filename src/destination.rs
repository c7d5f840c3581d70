//! Destinations for serialized records.
//!
//! Every variant appends the newline terminator itself; what differs is the
//! error policy. Standard output treats any failure as fatal to the whole
//! process. UDP is fire-and-forget. A unix datagram destination either
//! fires and forgets or blocks in a retry loop until the local consumer is
//! reachable again (deliberate back-pressure). TCP connects lazily and, on
//! any send failure, drops the connection and retries forever; the retry
//! covers the line at hand, but a line the kernel had already accepted into
//! a dead socket can go down with it, so delivery is at-most-once per
//! broken connection.

use std::fmt;
use std::io::{self, Write};
use std::net::{TcpStream, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::signals::ShutdownHandle;

/// Pause between reconnect or redeliver attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

fn frame(record: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(record.len() + 1);
    framed.extend_from_slice(record);
    framed.push(b'\n');
    framed
}

/// A configured destination. Closed set, like [`Source`](crate::Source).
#[derive(Debug)]
pub enum Destination {
    /// Write to standard output; errors are fatal.
    Stdout(StdoutDestination),
    /// Stream over TCP with infinite reconnect.
    Tcp(TcpDestination),
    /// Fire-and-forget UDP datagrams.
    Udp(UdpDestination),
    /// Unix datagrams, optionally retried until deliverable.
    Unix(UnixDestination),
}

impl Destination {
    /// Write records to standard output.
    pub fn stdout() -> Destination {
        Destination::Stdout(StdoutDestination { out: io::stdout() })
    }

    /// Stream records to `host:port` over TCP.
    pub fn tcp(host: &str, port: u16) -> Destination {
        Destination::Tcp(TcpDestination {
            host: host.to_owned(),
            port,
            stream: None,
            retry_interval: RETRY_INTERVAL,
            warned: false,
        })
    }

    /// Send each record as one UDP datagram to `host:port`.
    pub fn udp(host: &str, port: u16) -> io::Result<Destination> {
        Ok(Destination::Udp(UdpDestination {
            host: host.to_owned(),
            port,
            socket: UdpSocket::bind(("0.0.0.0", 0))?,
        }))
    }

    /// Send each record as one datagram to the unix socket at `path`.
    /// With `retry` the send is repeated until the consumer accepts it.
    pub fn unix(path: &Path, retry: bool) -> io::Result<Destination> {
        Ok(Destination::Unix(UnixDestination {
            path: path.to_owned(),
            retry,
            socket: UnixDatagram::unbound()?,
            retry_interval: RETRY_INTERVAL,
            warned: false,
        }))
    }

    /// Override the pause between retries (TCP reconnect, unix redeliver).
    pub fn retry_interval(mut self, interval: Duration) -> Destination {
        match &mut self {
            Destination::Tcp(destination) => destination.retry_interval = interval,
            Destination::Unix(destination) => destination.retry_interval = interval,
            Destination::Stdout(_) | Destination::Udp(_) => {}
        }
        self
    }

    /// Deliver one serialized record, newline appended, per this variant's
    /// policy. Retry loops bail out with `ErrorKind::Interrupted` once
    /// `shutdown` is raised.
    pub fn send(&mut self, record: &[u8], shutdown: &ShutdownHandle) -> io::Result<()> {
        match self {
            Destination::Stdout(destination) => destination.send(record),
            Destination::Tcp(destination) => destination.send(record, shutdown),
            Destination::Udp(destination) => destination.send(record),
            Destination::Unix(destination) => destination.send(record, shutdown),
        }
    }

    /// Release the connection or socket. Part of the deterministic
    /// shutdown pass; nothing here is left to `Drop`.
    pub fn close(&mut self) {
        match self {
            Destination::Stdout(destination) => {
                let _ = destination.out.lock().flush();
            }
            Destination::Tcp(destination) => destination.disconnect(),
            Destination::Udp(_) | Destination::Unix(_) => {}
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Stdout(_) => f.write_str("stdout"),
            Destination::Tcp(destination) => fmt::Display::fmt(destination, f),
            Destination::Udp(destination) => {
                write!(f, "udp:{}:{}", destination.host, destination.port)
            }
            Destination::Unix(destination) => fmt::Display::fmt(destination, f),
        }
    }
}

/// Writes records to standard output, flushing after every line.
#[derive(Debug)]
pub struct StdoutDestination {
    out: io::Stdout,
}

impl StdoutDestination {
    fn send(&mut self, record: &[u8]) -> io::Result<()> {
        let mut out = self.out.lock();
        out.write_all(record)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// A lazily connected, endlessly reconnecting TCP stream.
#[derive(Debug)]
pub struct TcpDestination {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    retry_interval: Duration,
    warned: bool,
}

impl TcpDestination {
    fn send(&mut self, record: &[u8], shutdown: &ShutdownHandle) -> io::Result<()> {
        let framed = frame(record);
        loop {
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    self.connect(shutdown)?;
                    continue;
                }
            };
            match stream.write_all(&framed) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    // A previous line may already sit in the dead socket's
                    // buffer and go down with it; the retry only covers the
                    // line at hand.
                    warn!("send to {} failed: {}; reconnecting", self, err);
                    self.disconnect();
                }
            }
        }
    }

    fn connect(&mut self, shutdown: &ShutdownHandle) -> io::Result<()> {
        loop {
            if shutdown.is_requested() {
                return Err(io::ErrorKind::Interrupted.into());
            }
            match TcpStream::connect((self.host.as_str(), self.port)) {
                Ok(stream) => {
                    if self.warned {
                        info!("connected to {}", self);
                    }
                    self.warned = false;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    if self.warned {
                        debug!("still cannot connect to {}: {}", self, err);
                    } else {
                        warn!("cannot connect to {}: {}; retrying", self, err);
                        self.warned = true;
                    }
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

impl fmt::Display for TcpDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}:{}", self.host, self.port)
    }
}

/// Fire-and-forget UDP sender.
#[derive(Debug)]
pub struct UdpDestination {
    host: String,
    port: u16,
    socket: UdpSocket,
}

impl UdpDestination {
    fn send(&mut self, record: &[u8]) -> io::Result<()> {
        let framed = frame(record);
        if let Err(err) = self.socket.send_to(&framed, (self.host.as_str(), self.port)) {
            debug!("send to udp:{}:{} failed: {}", self.host, self.port, err);
        }
        Ok(())
    }
}

/// Unix datagram sender, optionally blocking until the peer is reachable.
#[derive(Debug)]
pub struct UnixDestination {
    path: PathBuf,
    retry: bool,
    socket: UnixDatagram,
    retry_interval: Duration,
    warned: bool,
}

impl UnixDestination {
    fn send(&mut self, record: &[u8], shutdown: &ShutdownHandle) -> io::Result<()> {
        let framed = frame(record);
        if !self.retry {
            if let Err(err) = self.socket.send_to(&framed, &self.path) {
                debug!("send to {} failed: {}", self, err);
            }
            return Ok(());
        }
        loop {
            match self.socket.send_to(&framed, &self.path) {
                Ok(_) => {
                    if self.warned {
                        info!("{} is accepting records again", self);
                    }
                    self.warned = false;
                    return Ok(());
                }
                Err(err) => {
                    if shutdown.is_requested() {
                        return Err(io::ErrorKind::Interrupted.into());
                    }
                    if !self.warned {
                        warn!(
                            "send to {} failed: {}; blocking until the consumer is back",
                            self, err
                        );
                        self.warned = true;
                    }
                    thread::sleep(self.retry_interval);
                }
            }
        }
    }
}

impl fmt::Display for UnixDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unix:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn udp_appends_a_newline_and_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let mut destination = Destination::udp("127.0.0.1", port).unwrap();
        destination
            .send(b"{\"message\":\"hi\"}", &ShutdownHandle::new())
            .unwrap();

        let mut buffer = [0u8; 128];
        let received = receiver.recv(&mut buffer).unwrap();
        assert_eq!(&buffer[..received], b"{\"message\":\"hi\"}\n");
    }

    #[test]
    fn unix_fire_and_forget_swallows_a_missing_peer() {
        let dir = tempfile::tempdir().unwrap();
        let mut destination =
            Destination::unix(&dir.path().join("nobody.sock"), false).unwrap();
        destination.send(b"lost", &ShutdownHandle::new()).unwrap();
    }

    #[test]
    fn unix_retry_delivers_to_a_live_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer.sock");
        let consumer = UnixDatagram::bind(&path).unwrap();

        let mut destination = Destination::unix(&path, true).unwrap();
        destination.send(b"kept", &ShutdownHandle::new()).unwrap();

        let mut buffer = [0u8; 64];
        let received = consumer.recv(&mut buffer).unwrap();
        assert_eq!(&buffer[..received], b"kept\n");
    }

    #[test]
    fn unix_retry_is_cancelled_by_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut destination = Destination::unix(&dir.path().join("nobody.sock"), true)
            .unwrap()
            .retry_interval(Duration::from_millis(10));
        let shutdown = ShutdownHandle::new();
        shutdown.request();
        let started = Instant::now();
        let err = destination.send(b"doomed", &shutdown).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn tcp_connects_lazily_and_frames_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut destination = Destination::tcp("127.0.0.1", port);
        let shutdown = ShutdownHandle::new();

        destination.send(b"one", &shutdown).unwrap();
        destination.send(b"two", &shutdown).unwrap();

        let (peer, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "one\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "two\n");
    }

    #[test]
    fn tcp_reconnect_is_cancelled_by_shutdown() {
        // grab a port with no listener behind it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut destination =
            Destination::tcp("127.0.0.1", port).retry_interval(Duration::from_millis(10));
        let shutdown = ShutdownHandle::new();
        shutdown.request();
        let started = Instant::now();
        let err = destination.send(b"doomed", &shutdown).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn tcp_reconnects_after_the_peer_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut destination =
            Destination::tcp("127.0.0.1", port).retry_interval(Duration::from_millis(10));
        let shutdown = ShutdownHandle::new();

        destination.send(b"first", &shutdown).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(peer);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "first\n");
        drop(reader);

        // Keep sending until the broken pipe surfaces and the destination
        // comes back with a fresh connection. At most one line is lost.
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let replacement = loop {
            assert!(Instant::now() < deadline, "destination never reconnected");
            destination.send(b"filler", &shutdown).unwrap();
            match listener.accept() {
                Ok((conn, _)) => break conn,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        destination.send(b"final", &shutdown).unwrap();

        replacement
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(replacement);
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            assert!(!line.is_empty(), "connection closed before \"final\" arrived");
            if line == "final\n" {
                break;
            }
            assert_eq!(line, "filler\n");
        }
    }
}
