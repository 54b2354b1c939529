//! Error types for the harness

use std::io;
use thiserror::Error;

use crate::parser::tds::TdsParseError;

/// Every entry point surfaces at most one of these.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A listener or mock target could not bind its loopback port
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The proxy service could not be built or started
    #[error("proxy construction failed: {0}")]
    ProxyConstruction(String),

    /// A proxied connection failed after it was accepted
    #[error("proxy error: {0}")]
    Proxy(String),

    /// The database client failed to run its query
    #[error("client error: {0}")]
    Client(String),

    /// The mock target failed to accept or parse the handshake
    #[error("mock target error: {0}")]
    Mock(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] TdsParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// Re-labels any error raised while driving the client as a client error.
    pub(crate) fn into_client(self) -> Self {
        match self {
            HarnessError::Client(_) => self,
            other => HarnessError::Client(other.to_string()),
        }
    }

    pub(crate) fn into_mock(self) -> Self {
        match self {
            HarnessError::Mock(_) | HarnessError::Bind { .. } => self,
            other => HarnessError::Mock(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

impl From<serde_yaml::Error> for HarnessError {
    fn from(err: serde_yaml::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}
