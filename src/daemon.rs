//! Process lifecycle helpers: pid file, detaching, privilege drop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Group, Pid, User, fork, setgid, setsid, setuid};

/// Exclusive process marker.
///
/// Created with create-new semantics, so a second instance on the same pid
/// file fails with `AlreadyExists` instead of clobbering the first. The
/// file is removed on drop, but only by the process whose PID it records —
/// a forked child that never claimed it leaves it alone.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
    pid: u32,
}

impl PidFile {
    /// Create the pid file, failing if it already exists.
    pub fn create(path: &Path) -> io::Result<PidFile> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut pid_file = PidFile {
            path: path.to_owned(),
            file,
            pid: 0,
        };
        pid_file.update()?;
        Ok(pid_file)
    }

    /// Rewrite the file with the current PID. Call again in the child
    /// after a fork, which also makes the child the owning process.
    pub fn update(&mut self) -> io::Result<()> {
        self.pid = std::process::id();
        let content = format!("{}\n", self.pid);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(content.as_bytes())?;
        self.file.set_len(content.len() as u64)
    }

    /// Give up ownership: the file stays behind when this handle drops.
    pub fn disown(mut self) {
        self.pid = 0;
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if self.pid == std::process::id() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Send `signal` to the process recorded in the pid file at `path`.
pub fn signal(path: &Path, signal: Signal) -> io::Result<()> {
    let content = fs::read_to_string(path)?;
    let pid = content.trim().parse::<i32>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed pid file {}", path.display()),
        )
    })?;
    kill(Pid::from_raw(pid), signal).map_err(io::Error::from)
}

/// Which side of the fork [`detach`] returned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The original process; it should exit without touching shared state.
    Parent,
    /// The detached daemon: session leader, stdio on `/dev/null`.
    Child,
}

/// Detach from the controlling terminal.
///
/// The child becomes a session leader, optionally changes directory, and
/// gets stdin/stdout/stderr redirected to `/dev/null`.
pub fn detach(new_cwd: Option<&Path>) -> io::Result<DetachOutcome> {
    // fork(2) is only safe while the process is single-threaded, which a
    // daemon at startup still is.
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { child } => {
            debug!("detached child {child}");
            Ok(DetachOutcome::Parent)
        }
        ForkResult::Child => {
            setsid().map_err(io::Error::from)?;
            if let Some(dir) = new_cwd {
                std::env::set_current_dir(dir)?;
            }
            redirect_stdio_to_devnull()?;
            Ok(DetachOutcome::Child)
        }
    }
}

fn redirect_stdio_to_devnull() -> io::Result<()> {
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Drop to the given user and/or group, group first — after the UID
/// change, switching the primary group may no longer be permitted.
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> io::Result<()> {
    let user = match user {
        Some(name) => Some(
            User::from_name(name)
                .map_err(io::Error::from)?
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("unknown user: {name}"))
                })?,
        ),
        None => None,
    };
    // the user's primary group, unless a group is named explicitly
    let mut gid = user.as_ref().map(|user| user.gid);
    if let Some(name) = group {
        let group = Group::from_name(name)
            .map_err(io::Error::from)?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("unknown group: {name}"))
            })?;
        gid = Some(group.gid);
    }
    if let Some(gid) = gid {
        setgid(gid).map_err(io::Error::from)?;
    }
    if let Some(user) = user {
        setuid(user.uid).map_err(io::Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_records_this_process_and_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logdevd.pid");
        let pid_file = PidFile::create(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("{}\n", std::process::id()));
        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn a_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logdevd.pid");
        let _first = PidFile::create(&path).unwrap();
        let err = PidFile::create(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn disowning_leaves_the_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logdevd.pid");
        PidFile::create(&path).unwrap().disown();
        assert!(path.exists());
    }

    #[test]
    fn signalling_a_garbage_pid_file_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logdevd.pid");
        fs::write(&path, "not a pid\n").unwrap();
        let err = signal(&path, Signal::SIGHUP).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn dropping_to_an_unknown_user_fails() {
        let err = drop_privileges(Some("no-such-user-here"), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
