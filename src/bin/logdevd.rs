//! The logdevourer daemon front-end.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};
use nix::sys::signal::Signal;

use logdevourer::config::{self, ConfigError};
use logdevourer::{Engine, Passthrough, RunOutcome, daemon, logging, signals};

/// Something failed at runtime.
const EXIT_RUNTIME: u8 = 1;
/// The configuration could not be loaded or makes no sense.
const EXIT_CONFIG: u8 = 2;
/// Another instance holds the pid file.
const EXIT_PIDFILE: u8 = 3;
/// Privileges could not be dropped.
const EXIT_PRIVILEGES: u8 = 4;

#[derive(Parser)]
#[command(name = "logdevd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in the foreground, logging to stderr
    Run {
        /// Configuration file
        #[arg(long, value_name = "FILE", required_unless_present = "stdio")]
        config: Option<PathBuf>,
        /// Directory for persistent read positions
        #[arg(long, value_name = "DIR", default_value = "/var/lib/logdevd")]
        state_dir: PathBuf,
        /// Ignore configured endpoints and wire stdin to stdout
        #[arg(long)]
        stdio: bool,
    },
    /// Detach from the terminal and run as a daemon
    Start {
        /// Configuration file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Directory for persistent read positions
        #[arg(long, value_name = "DIR", default_value = "/var/lib/logdevd")]
        state_dir: PathBuf,
        /// Exclusive pid file for this instance
        #[arg(long, value_name = "FILE")]
        pid_file: PathBuf,
        /// Drop privileges to this user after startup
        #[arg(long)]
        user: Option<String>,
        /// Drop privileges to this group after startup
        #[arg(long)]
        group: Option<String>,
        /// Syslog facility for daemon diagnostics
        #[arg(long, default_value = "daemon")]
        facility: String,
    },
    /// Tell a running daemon to re-read its configuration
    Reload {
        /// Pid file of the running daemon
        #[arg(long, value_name = "FILE")]
        pid_file: PathBuf,
    },
    /// Shut a running daemon down
    Stop {
        /// Pid file of the running daemon
        #[arg(long, value_name = "FILE")]
        pid_file: PathBuf,
    },
}

fn main() -> ExitCode {
    match Cli::parse().command {
        Command::Run {
            config,
            state_dir,
            stdio,
        } => run_foreground(config.as_deref(), &state_dir, stdio),
        Command::Start {
            config,
            state_dir,
            pid_file,
            user,
            group,
            facility,
        } => start_daemon(
            &config,
            &state_dir,
            &pid_file,
            user.as_deref(),
            group.as_deref(),
            &facility,
        ),
        Command::Reload { pid_file } => signal_daemon(&pid_file, Signal::SIGHUP),
        Command::Stop { pid_file } => signal_daemon(&pid_file, Signal::SIGTERM),
    }
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Runtime(io::Error),
}

fn report(err: &ServeError) -> ExitCode {
    error!("{err}");
    match err {
        ServeError::Config(_) => ExitCode::from(EXIT_CONFIG),
        ServeError::Runtime(_) => ExitCode::from(EXIT_RUNTIME),
    }
}

/// Build an engine from the configuration and run it, rebuilding on every
/// reload, until shutdown.
fn serve(config_path: &Path, state_dir: &Path) -> Result<(), ServeError> {
    loop {
        let config = config::load(config_path)?;
        if config.rulebase.is_some() {
            // TODO: compile the configured rulebase once the liblognorm
            // bindings are packaged; until then every line passes through
            info!("rulebase configured but rule compilation is not available; passing lines through");
        }
        std::fs::create_dir_all(state_dir).map_err(ServeError::Runtime)?;
        let mut engine = Engine::from_config(&config, state_dir, Box::new(Passthrough))
            .map_err(ServeError::Runtime)?;
        info!(
            "started: {} source(s), {} destination(s)",
            config.sources.len(),
            config.destinations.len()
        );
        match engine.run().map_err(ServeError::Runtime)? {
            RunOutcome::Shutdown => {
                info!("shut down");
                return Ok(());
            }
            RunOutcome::Reload => info!("reloading configuration"),
        }
    }
}

fn run_foreground(config: Option<&Path>, state_dir: &Path, stdio: bool) -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = signals::install() {
        error!("cannot install signal handlers: {err}");
        return ExitCode::from(EXIT_RUNTIME);
    }
    let result = if stdio {
        serve_stdio()
    } else {
        match config {
            Some(config) => serve(config, state_dir),
            // clap enforces this already; belt and braces
            None => {
                error!("--config is required unless --stdio is given");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn serve_stdio() -> Result<(), ServeError> {
    loop {
        let mut engine = Engine::stdio(Box::new(Passthrough));
        match engine.run().map_err(ServeError::Runtime)? {
            RunOutcome::Shutdown => return Ok(()),
            RunOutcome::Reload => {} // nothing to re-read in stdio mode
        }
    }
}

fn start_daemon(
    config_path: &Path,
    state_dir: &Path,
    pid_path: &Path,
    user: Option<&str>,
    group: Option<&str>,
    facility: &str,
) -> ExitCode {
    // Fail fast on anything checkable while stderr is still a terminal.
    if let Err(err) = config::load(config_path) {
        eprintln!("logdevd: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }
    if logging::facility_from_name(facility).is_none() {
        eprintln!("logdevd: invalid syslog facility: {facility}");
        return ExitCode::from(EXIT_CONFIG);
    }
    let mut pid_file = match daemon::PidFile::create(pid_path) {
        Ok(pid_file) => pid_file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            eprintln!(
                "logdevd: pid file {} exists; is another instance running?",
                pid_path.display()
            );
            return ExitCode::from(EXIT_PIDFILE);
        }
        Err(err) => {
            eprintln!(
                "logdevd: cannot create pid file {}: {err}",
                pid_path.display()
            );
            return ExitCode::from(EXIT_RUNTIME);
        }
    };
    match daemon::detach(Some(Path::new("/"))) {
        Ok(daemon::DetachOutcome::Parent) => {
            // the child owns the pid file from here on
            pid_file.disown();
            return ExitCode::SUCCESS;
        }
        Ok(daemon::DetachOutcome::Child) => {}
        Err(err) => {
            eprintln!("logdevd: cannot detach: {err}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    }
    if let Err(err) = logging::init_syslog("logdevd", facility, log::LevelFilter::Info) {
        // stderr is /dev/null by now; nothing sensible left to report to
        let _ = err;
        return ExitCode::from(EXIT_RUNTIME);
    }
    if let Err(err) = pid_file.update() {
        error!("cannot rewrite pid file: {err}");
    }
    if let Err(err) = daemon::drop_privileges(user, group) {
        error!("cannot drop privileges: {err}");
        return ExitCode::from(EXIT_PRIVILEGES);
    }
    if let Err(err) = signals::install() {
        error!("cannot install signal handlers: {err}");
        return ExitCode::from(EXIT_RUNTIME);
    }
    let code = match serve(config_path, state_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    };
    // unlink the pid file before the process goes away
    drop(pid_file);
    code
}

fn signal_daemon(pid_path: &Path, signal: Signal) -> ExitCode {
    match daemon::signal(pid_path, signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("logdevd: {err}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
