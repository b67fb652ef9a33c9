//! Immutable, process-lifetime configuration loaded once at startup
//! from a TOML file named on `argv[1]`. Missing keys are fatal.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
struct RawSettings {
    address: Option<String>,
    port: u16,
    workers_count: Option<usize>,
    backlog_size: Option<i32>,
    maildir: String,
    log: String,
    max_in_message_size: Option<usize>,
    timeout: Option<i64>,
    daemon: Option<bool>,
}

macro_rules! require {
    ($raw:expr, $field:ident, $name:literal) => {
        $raw.$field.ok_or(ConfigError::Missing($name))?
    };
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub address: Option<IpAddr>,
    pub port: u16,
    pub workers_count: usize,
    pub backlog_size: i32,
    pub maildir_root: PathBuf,
    pub log_path: PathBuf,
    pub max_in_message_size: usize,
    pub timeout_ms: i64,
    pub daemon: bool,
}

impl Settings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&contents, path)
    }

    /// Same as [`Settings::load`], read with blocking I/O. Startup
    /// reads the configuration before any runtime exists: the process
    /// still needs to `fork()` the master/worker/logger topology, and
    /// that must happen before a multi-threaded reactor is alive.
    pub fn load_sync(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let raw: RawSettings = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if raw.maildir.is_empty() {
            return Err(ConfigError::Missing("maildir"));
        }
        if raw.log.is_empty() {
            return Err(ConfigError::Missing("log"));
        }

        let address = match raw.address.as_deref() {
            None | Some("") | Some("*") => None,
            Some(a) => Some(a.parse().map_err(|_| ConfigError::Missing("address"))?),
        };

        let workers_count = require!(raw, workers_count, "workers_count");
        if workers_count < 1 {
            return Err(ConfigError::Invalid {
                field: "workers_count",
                reason: "must be at least 1",
            });
        }

        Ok(Settings {
            address,
            port: raw.port,
            workers_count,
            backlog_size: require!(raw, backlog_size, "backlog_size"),
            maildir_root: PathBuf::from(raw.maildir),
            log_path: PathBuf::from(raw.log),
            max_in_message_size: require!(raw, max_in_message_size, "max_in_message_size"),
            timeout_ms: require!(raw, timeout, "timeout"),
            daemon: require!(raw, daemon, "daemon"),
        })
    }
}
