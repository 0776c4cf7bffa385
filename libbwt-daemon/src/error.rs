use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use libbwt_core::{ConfigError, ServerKind, ShutdownHandle};

use crate::bitcoind::RpcError;

/// Error surface for the daemon lifecycle, its listeners and the node RPC.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid config: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("failed to bind {server} server on {addr}: {source}")]
    BindFailed {
        server: ServerKind,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("waiting for bitcoind failed: {0}")]
    SyncFailed(#[source] RpcError),

    #[error("daemon {handle} did not stop within {timeout:?}")]
    ShutdownTimeout {
        handle: ShutdownHandle,
        timeout: Duration,
    },

    #[error("no running daemon for handle {0}")]
    UnknownHandle(ShutdownHandle),

    /// Start-up was interrupted by a shutdown request. `start` reports this
    /// as a successful termination.
    #[error("daemon start canceled by shutdown")]
    Canceled,

    #[error("bitcoind RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon runtime error: {0}")]
    Runtime(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
