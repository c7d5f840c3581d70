//! The main loop: wait for readiness, drain lines, normalize, fan out.
//!
//! Single-threaded and cooperative. One poll(2) round per tick drives the
//! pollable sources; tailed files are drained every tick regardless, since
//! readiness means nothing for them. Rotation checks and position flushes
//! also ride the tick. Shutdown and reload arrive as flags (see
//! [`signals`](crate::signals)) checked at the top of every iteration, and
//! every blocking retry loop downstream honors the same handle.

use std::io;
use std::path::Path;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::{Config, DestinationSpec, SourceSpec};
use crate::destination::Destination;
use crate::normalize::{self, Normalizer};
use crate::poll::Poller;
use crate::signals::{self, ShutdownHandle};
use crate::source::Source;

/// Default poll tick: how long one readiness wait may last.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Why [`Engine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// SIGTERM/SIGINT (or a handle request): the process should exit.
    Shutdown,
    /// SIGHUP: the caller should rebuild the engine from fresh
    /// configuration and run again.
    Reload,
}

/// The source/sink multiplexing engine.
///
/// Owns every source and destination for the life of the process. Sources
/// that fail to open are retried each tick; sources that fail while
/// reading are closed and deregistered without taking the engine down.
/// Only a standard-output write error is fatal.
pub struct Engine {
    sources: Vec<Source>,
    destinations: Vec<Destination>,
    normalizer: Box<dyn Normalizer>,
    poller: Poller,
    interval: Duration,
    shutdown: ShutdownHandle,
}

impl Engine {
    /// Assemble an engine from already-built parts.
    pub fn new(
        sources: Vec<Source>,
        destinations: Vec<Destination>,
        normalizer: Box<dyn Normalizer>,
        interval: Duration,
    ) -> Engine {
        Engine {
            sources,
            destinations,
            normalizer,
            poller: Poller::new(),
            interval,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Build sources and destinations from loaded configuration.
    pub fn from_config(
        config: &Config,
        state_dir: &Path,
        normalizer: Box<dyn Normalizer>,
    ) -> io::Result<Engine> {
        let mut sources = Vec::with_capacity(config.sources.len());
        for spec in &config.sources {
            sources.push(match spec {
                SourceSpec::File { path } => Source::file(path, state_dir)?,
                SourceSpec::Udp { host, port } => Source::udp(host.clone(), *port),
                SourceSpec::Unix { path } => Source::unix(path),
                SourceSpec::Stdin => Source::stdin(),
            });
        }
        let mut destinations = Vec::with_capacity(config.destinations.len());
        for spec in &config.destinations {
            destinations.push(match spec {
                DestinationSpec::Stdout => Destination::stdout(),
                DestinationSpec::Tcp { host, port } => Destination::tcp(host, *port),
                DestinationSpec::Udp { host, port } => Destination::udp(host, *port)?,
                DestinationSpec::Unix { path, retry } => Destination::unix(path, *retry)?,
            });
        }
        Ok(Engine::new(sources, destinations, normalizer, DEFAULT_TICK))
    }

    /// The pipe-debugging wiring: standard input to standard output.
    pub fn stdio(normalizer: Box<dyn Normalizer>) -> Engine {
        Engine::new(
            vec![Source::stdin()],
            vec![Destination::stdout()],
            normalizer,
            DEFAULT_TICK,
        )
    }

    /// A cancellation handle for this engine; clones may be handed to other
    /// threads or stashed for tests.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown or reload, then flush and close everything.
    pub fn run(&mut self) -> io::Result<RunOutcome> {
        let outcome = loop {
            if self.shutdown.is_requested() {
                break RunOutcome::Shutdown;
            }
            if signals::take_reload() {
                break RunOutcome::Reload;
            }
            if let Err(err) = self.tick() {
                self.close();
                return Err(err);
            }
        };
        self.close();
        Ok(outcome)
    }

    /// One round of the loop: retry unopened sources, wait for readiness,
    /// drain, handle rotations, flush positions.
    ///
    /// Public so tests and embedders can drive the engine deterministically;
    /// [`run`](Engine::run) is this in a loop.
    pub fn tick(&mut self) -> io::Result<()> {
        self.open_pending();
        let mut ready = self.poller.poll(self.interval)?;
        for (index, source) in self.sources.iter().enumerate() {
            if !source.is_pollable() && source.is_open() {
                ready.push(index);
            }
        }
        for index in ready {
            self.drain(index)?;
        }
        self.handle_rotations();
        self.flush_positions();
        Ok(())
    }

    /// Flush every source and close sources and destinations. Also run by
    /// [`run`](Engine::run) on its way out; explicit, not left to `Drop`.
    pub fn close(&mut self) {
        for index in 0..self.sources.len() {
            self.sources[index].close();
            self.poller.remove(index);
        }
        for destination in &mut self.destinations {
            destination.close();
        }
    }

    fn open_pending(&mut self) {
        for (index, source) in self.sources.iter_mut().enumerate() {
            if source.is_open() || source.is_closed() {
                continue;
            }
            source.open();
            if source.is_open() {
                self.poller.add(index, source);
            }
        }
    }

    /// Drain one source completely, pushing every line through the
    /// normalizer and on to every destination in configured order.
    fn drain(&mut self, index: usize) -> io::Result<()> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(());
            }
            let line = match self.sources[index].next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    error!(
                        "read error on {}: {}; closing this source",
                        self.sources[index], err
                    );
                    self.sources[index].close();
                    self.poller.remove(index);
                    break;
                }
            };
            let Some(record) = self.normalizer.normalize(&line) else {
                continue;
            };
            let payload = match normalize::serialize(&record) {
                Ok(payload) => payload,
                Err(err) => {
                    // a record that cannot be serialized breaks the wire
                    // contract; nothing downstream can be trusted after it
                    error!("cannot serialize record from {}: {}", self.sources[index], err);
                    return Err(err);
                }
            };
            for destination in &mut self.destinations {
                match destination.send(&payload, &self.shutdown) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                        // a retry loop observed the shutdown flag
                        return Ok(());
                    }
                    Err(err) => {
                        error!("write error on {}: {}", destination, err);
                        return Err(err);
                    }
                }
            }
        }
        // An end-of-file'd descriptor stays readable forever under a
        // level-triggered poll; once a source closes itself, stop asking.
        if self.sources[index].is_closed() {
            self.poller.remove(index);
        }
        Ok(())
    }

    fn handle_rotations(&mut self) {
        for index in 0..self.sources.len() {
            if self.sources[index].rotation_needed() {
                info!("reopening {}", self.sources[index]);
                self.sources[index].reopen();
                // kept for symmetry; file sources are never pollable
                if self.sources[index].is_pollable() {
                    self.poller.add(index, &self.sources[index]);
                }
            }
        }
    }

    fn flush_positions(&mut self) {
        for source in &mut self.sources {
            if let Err(err) = source.flush() {
                warn!("cannot persist position of {}: {}", source, err);
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("sources", &self.sources.len())
            .field("destinations", &self.destinations.len())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
