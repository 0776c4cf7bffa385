//! Error types for libbwt-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Network;

/// All errors that can arise while parsing or validating a daemon config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config text is not valid JSON or does not match the schema.
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// The config file could not be read.
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `bitcoind_auth` must be `<user>:<password>`.
    #[error("bitcoind_auth must be formatted as <user>:<password>")]
    InvalidAuth,

    /// Explicit credentials and a cookie file were both given.
    #[error("bitcoind_auth and bitcoind_cookie are mutually exclusive")]
    ConflictingAuth,

    /// `require_addresses` is set but nothing to track was configured.
    #[error("no descriptors or xpubs configured (require_addresses is set)")]
    NoAddresses,

    #[error("invalid xpub '{0}': expected a base58check extended public key (xpub/tpub/ypub/zpub/upub/vpub)")]
    InvalidXpub(String),

    /// The key decoded but belongs to the other network family.
    #[error("xpub '{xpub}' does not belong to the {network} network")]
    XpubNetworkMismatch { xpub: String, network: Network },

    #[error("invalid descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("gap_limit must be at least 1")]
    InvalidGapLimit,

    #[error("poll_interval must be greater than zero")]
    InvalidPollInterval,

    /// Both listeners were pointed at the same socket address.
    #[error("electrum_addr and http_addr must differ (both set to {0})")]
    ListenerConflict(std::net::SocketAddr),
}
