//! Readiness multiplexing over the pollable sources.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::source::Source;

/// Level-triggered poll(2) wrapper.
///
/// Entries are `(token, fd)` pairs: the engine registers each source under
/// its own token and gets ready tokens back, so membership survives a
/// source losing its descriptor. Identity is by descriptor number, and only
/// sources whose readiness is meaningful ([`Source::is_pollable`]) are
/// accepted.
#[derive(Debug, Default)]
pub struct Poller {
    entries: Vec<(usize, RawFd)>,
}

impl Poller {
    /// An empty poller.
    pub fn new() -> Poller {
        Poller::default()
    }

    /// Register `source` under `token`. Returns whether it was added: a
    /// non-pollable source, a source without a descriptor, and a descriptor
    /// already present are all quietly refused.
    pub fn add(&mut self, token: usize, source: &Source) -> bool {
        if !source.is_pollable() {
            return false;
        }
        let Some(fd) = source.fileno() else {
            return false;
        };
        if self.entries.iter().any(|(_, entry)| *entry == fd) {
            return false;
        }
        self.entries.push((token, fd));
        true
    }

    /// Deregister whatever is registered under `token`, if anything.
    pub fn remove(&mut self, token: usize) {
        self.entries.retain(|(entry, _)| *entry != token);
    }

    /// Whether this source's descriptor is registered.
    pub fn contains(&self, source: &Source) -> bool {
        source
            .fileno()
            .is_some_and(|fd| self.entries.iter().any(|(_, entry)| *entry == fd))
    }

    /// Number of registered descriptors.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait up to `timeout` for readability and return the ready tokens.
    ///
    /// With nothing registered this still sleeps for the timeout, which is
    /// exactly what the engine's tick wants. A signal interrupting the
    /// syscall yields an empty set instead of an error, so the caller's
    /// loop comes around to its shutdown flag.
    pub fn poll(&self, timeout: Duration) -> io::Result<Vec<usize>> {
        let mut fds: Vec<PollFd<'_>> = self
            .entries
            .iter()
            // Sound: every registered descriptor is owned by a source the
            // engine keeps alive for at least the duration of this call.
            .map(|(_, fd)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();
        let timeout = PollTimeout::from(u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX));
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(self
                .entries
                .iter()
                .zip(&fds)
                .filter(|(_, pollfd)| {
                    pollfd.revents().is_some_and(|revents| {
                        revents.intersects(
                            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                        )
                    })
                })
                .map(|((token, _), _)| *token)
                .collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::HandleSource;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;

    fn pipe_handle_source(name: &str) -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd, Source) {
        let (read_end, write_end) = pipe().unwrap();
        let mut handle = HandleSource::from_fd(read_end.as_raw_fd(), name);
        handle.open();
        (read_end, write_end, Source::Handle(handle))
    }

    #[test]
    fn unopened_sources_are_refused() {
        let mut poller = Poller::new();
        let source = Source::udp(Some("127.0.0.1".into()), 0); // never opened
        assert!(!poller.add(0, &source));
        assert!(poller.is_empty());
    }

    #[test]
    fn duplicate_descriptors_are_refused() {
        let (_read_end, _write_end, source) = pipe_handle_source("pipe");
        let mut poller = Poller::new();
        assert!(poller.add(0, &source));
        assert!(!poller.add(1, &source));
        assert_eq!(poller.count(), 1);
        assert!(poller.contains(&source));
    }

    #[test]
    fn quiet_descriptors_time_out_to_an_empty_set() {
        let (_read_end, _write_end, source) = pipe_handle_source("pipe");
        let mut poller = Poller::new();
        poller.add(7, &source);
        let ready = poller.poll(Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn readable_descriptors_report_their_token() {
        let (_read_end, write_end, source) = pipe_handle_source("pipe");
        let mut poller = Poller::new();
        poller.add(7, &source);
        write(&write_end, b"hello\n").unwrap();
        let ready = poller.poll(Duration::from_millis(100)).unwrap();
        assert_eq!(ready, vec![7]);
    }

    #[test]
    fn removal_is_by_token() {
        let (_read_end, write_end, source) = pipe_handle_source("pipe");
        let mut poller = Poller::new();
        poller.add(7, &source);
        poller.remove(7);
        assert!(poller.is_empty());
        assert!(!poller.contains(&source));
        write(&write_end, b"hello\n").unwrap();
        let ready = poller.poll(Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }
}
