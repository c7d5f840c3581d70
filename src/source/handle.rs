//! Reading lines from a pre-opened stream descriptor.
//!
//! The descriptor is externally owned (typically standard input): this
//! source switches it to non-blocking mode but never closes it. Reads are
//! chunked, split on newlines with the partial tail carried across reads,
//! and a definitive end-of-file marks the source closed so the engine stops
//! polling a descriptor that will stay readable forever.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use log::{debug, warn};
use memchr::memchr;

use crate::source::Line;

/// Chunk size for one non-blocking read.
const READ_CHUNK: usize = 1024;

/// Wraps an externally supplied descriptor, usually standard input.
#[derive(Debug)]
pub struct HandleSource {
    fd: RawFd,
    name: String,
    /// Complete lines split out of earlier chunks, not yet handed out.
    pending: VecDeque<Line>,
    /// Tail of the last chunk that did not end in a newline.
    partial: Vec<u8>,
    opened: bool,
    closed: bool,
}

impl HandleSource {
    /// Read from standard input.
    pub fn stdin() -> HandleSource {
        HandleSource::from_fd(libc::STDIN_FILENO, "stdin")
    }

    /// Read from an arbitrary stream descriptor. The caller keeps ownership
    /// of the descriptor and is responsible for closing it.
    pub fn from_fd(fd: RawFd, name: &str) -> HandleSource {
        HandleSource {
            fd,
            name: name.to_owned(),
            pending: VecDeque::new(),
            partial: Vec::new(),
            opened: false,
            closed: false,
        }
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn open(&mut self) {
        if self.opened || self.closed {
            return;
        }
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            warn!("cannot inspect {}: {}", self, io::Error::last_os_error());
            return;
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            warn!(
                "cannot switch {} to non-blocking mode: {}",
                self,
                io::Error::last_os_error()
            );
            return;
        }
        self.opened = true;
    }

    pub(crate) fn close(&mut self) {
        // Not ours to close(2); just stop reading from it.
        self.pending.clear();
        self.partial.clear();
        self.opened = false;
        self.closed = true;
    }

    pub(crate) fn fileno(&self) -> Option<RawFd> {
        if self.opened { Some(self.fd) } else { None }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.opened
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn next_line(&mut self) -> io::Result<Option<Line>> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(line));
        }
        if !self.opened {
            return Ok(None);
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = unsafe { libc::read(self.fd, chunk.as_mut_ptr().cast(), READ_CHUNK) };
            if read < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => Err(err),
                };
            }
            if read == 0 {
                // Definitive end of the stream.
                if !self.partial.is_empty() {
                    debug!(
                        "end of {}: dropping {} bytes of an unterminated line",
                        self,
                        self.partial.len()
                    );
                }
                self.close();
                return Ok(None);
            }
            self.split_chunk(&chunk[..read as usize]);
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
        }
    }

    fn split_chunk(&mut self, mut chunk: &[u8]) {
        while let Some(at) = memchr(b'\n', chunk) {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&chunk[..at]);
            self.pending.push_back(line);
            chunk = &chunk[at + 1..];
        }
        self.partial.extend_from_slice(chunk);
    }
}

impl fmt::Display for HandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
