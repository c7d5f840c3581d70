//! Shutdown and reload flags, and the signal handlers that set them.
//!
//! SIGTERM and SIGINT request termination, SIGHUP requests a configuration
//! reload. The handlers only store into process-wide atomics, which is all
//! an async-signal context is allowed to do; everything else happens on the
//! engine thread when it next looks at the flags. The handlers are
//! installed without `SA_RESTART` so a poll(2) in flight comes back with
//! EINTR and the flags are noticed within one tick.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

static TERMINATION: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination(_signal: libc::c_int) {
    TERMINATION.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload(_signal: libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}

/// Install the process signal handlers. Call once, before the engine runs.
pub fn install() -> io::Result<()> {
    let termination = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let reload = SigAction::new(
        SigHandler::Handler(on_reload),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &termination).map_err(io::Error::from)?;
        sigaction(Signal::SIGINT, &termination).map_err(io::Error::from)?;
        sigaction(Signal::SIGHUP, &reload).map_err(io::Error::from)?;
    }
    Ok(())
}

/// Whether SIGTERM or SIGINT was delivered. Sticky.
pub fn termination_requested() -> bool {
    TERMINATION.load(Ordering::SeqCst)
}

/// Consume a pending SIGHUP, if one was delivered since the last call.
pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::SeqCst)
}

/// Cooperative cancellation handle checked by the engine loop and by every
/// retry loop inside a destination.
///
/// A handle observes two things: its own flag (set with [`request`], used
/// by embedders and tests) and the process-wide termination flag the signal
/// handlers maintain. Clones share the same local flag.
///
/// [`request`]: ShutdownHandle::request
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// A fresh handle with its local flag cleared.
    pub fn new() -> ShutdownHandle {
        ShutdownHandle::default()
    }

    /// Request shutdown through this handle.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was requested, by this handle or by a signal.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || termination_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_starts_clear_and_latches() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_requested());
        let clone = handle.clone();
        clone.request();
        assert!(handle.is_requested());
        assert!(clone.is_requested());
    }

    #[test]
    fn fresh_handles_are_independent() {
        let first = ShutdownHandle::new();
        first.request();
        let second = ShutdownHandle::new();
        assert!(!second.is_requested());
    }
}
