//! Syslog backend for the `log` facade.
//!
//! Foreground runs log to stderr through `env_logger`; a detached daemon
//! has no stderr worth speaking of and logs to syslog(3) instead. The libc
//! interface is used directly: it never fails application-visibly, which is
//! exactly the "tolerate the log sink being down" behavior a daemon needs.

use std::ffi::CString;
use std::io;

use log::LevelFilter;

/// Resolve a facility name (`daemon`, `user`, `local0`..`local7`, ...).
pub fn facility_from_name(name: &str) -> Option<libc::c_int> {
    Some(match name {
        "auth" => libc::LOG_AUTH,
        "authpriv" => libc::LOG_AUTHPRIV,
        "cron" => libc::LOG_CRON,
        "daemon" => libc::LOG_DAEMON,
        "ftp" => libc::LOG_FTP,
        "kern" => libc::LOG_KERN,
        "local0" => libc::LOG_LOCAL0,
        "local1" => libc::LOG_LOCAL1,
        "local2" => libc::LOG_LOCAL2,
        "local3" => libc::LOG_LOCAL3,
        "local4" => libc::LOG_LOCAL4,
        "local5" => libc::LOG_LOCAL5,
        "local6" => libc::LOG_LOCAL6,
        "local7" => libc::LOG_LOCAL7,
        "lpr" => libc::LOG_LPR,
        "mail" => libc::LOG_MAIL,
        "news" => libc::LOG_NEWS,
        "syslog" => libc::LOG_SYSLOG,
        "user" => libc::LOG_USER,
        "uucp" => libc::LOG_UUCP,
        _ => return None,
    })
}

fn priority_for(level: log::Level) -> libc::c_int {
    match level {
        log::Level::Error => libc::LOG_ERR,
        log::Level::Warn => libc::LOG_WARNING,
        log::Level::Info => libc::LOG_INFO,
        log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
    }
}

/// Install a syslog logger for the whole process.
///
/// `process_name` becomes the syslog ident; an unknown `facility` is a
/// configuration error. Fails if some logger is already installed.
pub fn init_syslog(process_name: &str, facility: &str, max_level: LevelFilter) -> io::Result<()> {
    let Some(facility) = facility_from_name(facility) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid syslog facility: {facility}"),
        ));
    };
    let ident = CString::new(process_name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in process name"))?;
    unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, facility) };
    log::set_boxed_logger(Box::new(Syslog { _ident: ident })).map_err(io::Error::other)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Syslog {
    // openlog(3) keeps a pointer to the ident; the buffer must stay alive
    // as long as the logger does.
    _ident: CString,
}

impl log::Log for Syslog {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        // an embedded NUL cannot be passed through; logging must not fail
        let Ok(message) = CString::new(message) else {
            return;
        };
        unsafe { libc::syslog(priority_for(record.level()), c"%s".as_ptr(), message.as_ptr()) };
    }

    fn flush(&self) {}
}

impl Drop for Syslog {
    fn drop(&mut self) {
        unsafe { libc::closelog() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_facilities_resolve() {
        for name in ["daemon", "user", "local0", "local7", "syslog"] {
            assert!(facility_from_name(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn unknown_facilities_do_not() {
        assert!(facility_from_name("local8").is_none());
        assert!(facility_from_name("DAEMON").is_none());
        assert!(facility_from_name("").is_none());
    }

    #[test]
    fn levels_map_onto_syslog_priorities() {
        assert_eq!(priority_for(log::Level::Error), libc::LOG_ERR);
        assert_eq!(priority_for(log::Level::Warn), libc::LOG_WARNING);
        assert_eq!(priority_for(log::Level::Info), libc::LOG_INFO);
        assert_eq!(priority_for(log::Level::Debug), libc::LOG_DEBUG);
        assert_eq!(priority_for(log::Level::Trace), libc::LOG_DEBUG);
    }
}
