//! Error types shared across the crate. Handlers in the FSM dispatcher
//! translate [`StorageError`] into a `451` reply and an `Error`-state
//! transition; [`ConfigError`] is fatal at startup; [`ServerError`]
//! covers the connection-level read/write failures a worker's
//! per-connection loop can hit.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("recipient address {0:?} has no domain part")]
    NoDomain(String),
    #[error("path too long: {0:?}")]
    PathTooLong(PathBuf),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no write is in flight")]
    NoWriteInFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("could not read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("peer closed the connection")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
