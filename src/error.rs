//! Error types shared by the watcher, mapper and renderer

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while watching, mapping or rendering
#[derive(Debug, Error)]
pub enum Error {
    /// Endpoint address has a scheme we cannot connect to
    #[error("unknown URL scheme for docker endpoint: {0}")]
    InvalidUrl(String),

    /// Transport or API failure talking to a Docker endpoint
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Environment line without a `=` separator
    #[error("invalid line passed to parse: {0:?}")]
    InvalidLine(String),

    /// Could not determine which container we are running in
    #[error("unable to fetch container ID: {0}")]
    SelfIdentity(String),

    /// Filesystem failure writing config or credential files
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reload command could not be run or exited non-zero
    #[error("reload command failed: {0}")]
    Reload(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Runtime failure not covered above (used by non-Docker runtimes)
    #[error("{0}")]
    Runtime(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the runtime reported that the object no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
