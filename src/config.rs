//! Configuration loading.
//!
//! The YAML document is normalized into tagged [`SourceSpec`] and
//! [`DestinationSpec`] values right here; nothing past this module ever
//! sees a YAML shape. Anything unrecognized — an unknown `proto`, a
//! missing required field, a destination name that is not `stdout` — is a
//! hard error reported before the engine starts.
//!
//! ```yaml
//! sources:
//!   - /var/log/messages          # bare string: tail this file
//!   - proto: udp
//!     host: 127.0.0.1            # optional; absent or "" binds everything
//!     port: 514
//!   - proto: unix
//!     path: /var/run/log.sock
//!   - proto: stdin
//! destinations:
//!   - stdout
//!   - proto: tcp
//!     host: collector.example.net
//!     port: 5140
//!   - proto: unix
//!     path: /var/run/consumer.sock
//!     retry: false               # default true
//! options:
//!   rulebase: /etc/logdevd/rules.db
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Why configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read at all.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid YAML, or an entry has an unrecognized
    /// shape (unknown `proto`, missing field, wrong type).
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A bare destination name other than `stdout`/`STDOUT`.
    #[error("unrecognized destination: {0:?}")]
    UnknownDestination(String),
}

/// One configured source, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Tail a regular file.
    File {
        /// Path of the file to tail.
        path: PathBuf,
    },
    /// Receive UDP datagrams.
    Udp {
        /// Interface to bind; `None` means all interfaces.
        host: Option<String>,
        /// Port to bind.
        port: u16,
    },
    /// Receive unix datagrams.
    Unix {
        /// Socket path to bind.
        path: PathBuf,
    },
    /// Read standard input.
    Stdin,
}

/// One configured destination, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    /// Write to standard output.
    Stdout,
    /// Stream over TCP.
    Tcp {
        /// Peer host.
        host: String,
        /// Peer port.
        port: u16,
    },
    /// Send UDP datagrams.
    Udp {
        /// Peer host.
        host: String,
        /// Peer port.
        port: u16,
    },
    /// Send unix datagrams.
    Unix {
        /// Peer socket path.
        path: PathBuf,
        /// Whether to retry until the peer accepts (default true).
        retry: bool,
    },
}

/// A loaded, normalized configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sources, in configured order.
    pub sources: Vec<SourceSpec>,
    /// Destinations, in configured (= delivery) order.
    pub destinations: Vec<DestinationSpec>,
    /// Path of the normalizer rulebase, if one is configured.
    pub rulebase: Option<PathBuf>,
}

/// Read and normalize the configuration file at `path`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse(&text)
}

/// Normalize a configuration document already in memory.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(text)?;
    let sources = raw
        .sources
        .into_iter()
        .map(|entry| match entry {
            RawSource::File(path) => SourceSpec::File { path },
            RawSource::Socket(RawSocketSource::Udp { host, port }) => SourceSpec::Udp {
                host: host.filter(|host| !host.is_empty()),
                port,
            },
            RawSource::Socket(RawSocketSource::Unix { path }) => SourceSpec::Unix { path },
            RawSource::Socket(RawSocketSource::Stdin) => SourceSpec::Stdin,
        })
        .collect();
    let mut destinations = Vec::with_capacity(raw.destinations.len());
    for entry in raw.destinations {
        destinations.push(match entry {
            RawDestination::Name(name) if name == "stdout" || name == "STDOUT" => {
                DestinationSpec::Stdout
            }
            RawDestination::Name(name) => return Err(ConfigError::UnknownDestination(name)),
            RawDestination::Socket(RawSocketDestination::Stdout) => DestinationSpec::Stdout,
            RawDestination::Socket(RawSocketDestination::Tcp { host, port }) => {
                DestinationSpec::Tcp { host, port }
            }
            RawDestination::Socket(RawSocketDestination::Udp { host, port }) => {
                DestinationSpec::Udp { host, port }
            }
            RawDestination::Socket(RawSocketDestination::Unix { path, retry }) => {
                DestinationSpec::Unix { path, retry }
            }
        });
    }
    Ok(Config {
        sources,
        destinations,
        rulebase: raw.options.rulebase,
    })
}

#[derive(Deserialize)]
struct RawConfig {
    sources: Vec<RawSource>,
    destinations: Vec<RawDestination>,
    #[serde(default)]
    options: RawOptions,
}

#[derive(Deserialize, Default)]
struct RawOptions {
    rulebase: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSource {
    File(PathBuf),
    Socket(RawSocketSource),
}

#[derive(Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
enum RawSocketSource {
    Udp {
        #[serde(default)]
        host: Option<String>,
        port: u16,
    },
    Unix {
        path: PathBuf,
    },
    Stdin,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDestination {
    Name(String),
    Socket(RawSocketDestination),
}

#[derive(Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
enum RawSocketDestination {
    Stdout,
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
    Unix {
        path: PathBuf,
        #[serde(default = "default_retry")]
        retry: bool,
    },
}

fn default_retry() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_full_document_normalizes() {
        let config = parse(
            r#"
sources:
  - /var/log/messages
  - proto: udp
    host: 127.0.0.1
    port: 514
  - proto: unix
    path: /var/run/log.sock
  - proto: stdin
destinations:
  - stdout
  - proto: tcp
    host: collector.example.net
    port: 5140
  - proto: udp
    host: 10.0.0.1
    port: 5141
  - proto: unix
    path: /var/run/consumer.sock
    retry: false
options:
  rulebase: /etc/logdevd/rules.db
"#,
        )
        .unwrap();
        assert_eq!(
            config.sources,
            vec![
                SourceSpec::File {
                    path: "/var/log/messages".into()
                },
                SourceSpec::Udp {
                    host: Some("127.0.0.1".into()),
                    port: 514
                },
                SourceSpec::Unix {
                    path: "/var/run/log.sock".into()
                },
                SourceSpec::Stdin,
            ]
        );
        assert_eq!(
            config.destinations,
            vec![
                DestinationSpec::Stdout,
                DestinationSpec::Tcp {
                    host: "collector.example.net".into(),
                    port: 5140
                },
                DestinationSpec::Udp {
                    host: "10.0.0.1".into(),
                    port: 5141
                },
                DestinationSpec::Unix {
                    path: "/var/run/consumer.sock".into(),
                    retry: false
                },
            ]
        );
        assert_eq!(config.rulebase, Some("/etc/logdevd/rules.db".into()));
    }

    #[test]
    fn an_empty_udp_host_binds_everything() {
        let config = parse(
            "sources:\n  - proto: udp\n    host: \"\"\n    port: 514\ndestinations:\n  - stdout\n",
        )
        .unwrap();
        assert_eq!(
            config.sources,
            vec![SourceSpec::Udp {
                host: None,
                port: 514
            }]
        );
    }

    #[test]
    fn stdout_is_accepted_in_both_spellings_and_as_a_mapping() {
        let config = parse(
            "sources: []\ndestinations:\n  - stdout\n  - STDOUT\n  - proto: stdout\n",
        )
        .unwrap();
        assert_eq!(config.destinations.len(), 3);
        assert!(
            config
                .destinations
                .iter()
                .all(|destination| *destination == DestinationSpec::Stdout)
        );
    }

    #[test]
    fn unix_destination_retry_defaults_to_true() {
        let config = parse(
            "sources: []\ndestinations:\n  - proto: unix\n    path: /var/run/consumer.sock\n",
        )
        .unwrap();
        assert_eq!(
            config.destinations,
            vec![DestinationSpec::Unix {
                path: "/var/run/consumer.sock".into(),
                retry: true
            }]
        );
    }

    #[test]
    fn an_unknown_destination_name_is_rejected() {
        let err = parse("sources: []\ndestinations:\n  - stderr\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDestination(name) if name == "stderr"));
    }

    #[test]
    fn an_unknown_proto_is_rejected() {
        assert!(parse("sources:\n  - proto: carrier-pigeon\n    port: 1\ndestinations: []\n").is_err());
    }

    #[test]
    fn a_missing_required_field_is_rejected() {
        assert!(parse("sources:\n  - proto: udp\ndestinations: []\n").is_err());
        assert!(parse("sources: []\ndestinations:\n  - proto: tcp\n    host: somewhere\n").is_err());
    }

    #[test]
    fn missing_top_level_keys_are_rejected() {
        assert!(parse("destinations: []\n").is_err());
        assert!(parse("sources: []\n").is_err());
    }

    #[test]
    fn the_rulebase_is_optional() {
        let config = parse("sources: []\ndestinations: []\n").unwrap();
        assert_eq!(config.rulebase, None);
    }
}
