//! Daemon configuration document.
//!
//! The config arrives as one JSON object, is parsed once at start time and is
//! immutable afterwards. Every key is optional; unknown keys are ignored so
//! that configs written for richer builds still load.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bitcoin::base58;
use bitcoin::bip32::Xpub;
use miniscript::{Descriptor, DescriptorPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Network;

pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_INITIAL_IMPORT_SIZE: u32 = 350;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];
// xpub, ypub, zpub
const MAINNET_XPUB_VERSIONS: [[u8; 4]; 3] = [
    XPUB_VERSION,
    [0x04, 0x9d, 0x7c, 0xb2],
    [0x04, 0xb2, 0x47, 0x46],
];
// tpub, upub, vpub
const TESTNET_XPUB_VERSIONS: [[u8; 4]; 3] = [
    TPUB_VERSION,
    [0x04, 0x4a, 0x52, 0x62],
    [0x04, 0x5f, 0x1c, 0xf6],
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BwtConfig {
    pub network: Network,

    pub bitcoind_url: Option<String>,
    pub bitcoind_auth: Option<String>,
    pub bitcoind_dir: Option<PathBuf>,
    pub bitcoind_cookie: Option<PathBuf>,
    pub bitcoind_wallet: Option<String>,

    pub descriptors: Vec<String>,
    pub xpubs: Vec<String>,
    /// Unix timestamp to rescan from. `None` means no historical rescan.
    pub rescan_since: Option<u64>,
    pub gap_limit: u32,
    pub initial_import_size: u32,
    pub force_rescan: bool,
    pub require_addresses: bool,

    /// Accepts `[secs, nanos]` or `{"secs": .., "nanos": ..}`.
    pub poll_interval: Duration,
    pub verbose: usize,
    pub setup_logger: bool,

    pub electrum_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    pub http_cors: bool,
    pub webhooks_urls: Vec<String>,
}

impl Default for BwtConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            bitcoind_url: None,
            bitcoind_auth: None,
            bitcoind_dir: None,
            bitcoind_cookie: None,
            bitcoind_wallet: None,
            descriptors: vec![],
            xpubs: vec![],
            rescan_since: None,
            gap_limit: DEFAULT_GAP_LIMIT,
            initial_import_size: DEFAULT_INITIAL_IMPORT_SIZE,
            force_rescan: false,
            require_addresses: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            verbose: 0,
            setup_logger: false,
            electrum_addr: None,
            http_addr: None,
            http_cors: false,
            webhooks_urls: vec![],
        }
    }
}

impl BwtConfig {
    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BwtConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(auth) = &self.bitcoind_auth {
            if self.bitcoind_cookie.is_some() {
                return Err(ConfigError::ConflictingAuth);
            }
            match auth.split_once(':') {
                Some((user, _)) if !user.is_empty() => {}
                _ => return Err(ConfigError::InvalidAuth),
            }
        }

        if self.gap_limit == 0 {
            return Err(ConfigError::InvalidGapLimit);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval);
        }

        for xpub in &self.xpubs {
            validate_xpub(xpub, self.network)?;
        }
        for descriptor in &self.descriptors {
            validate_descriptor(descriptor)?;
        }

        if self.require_addresses && !self.has_addresses() {
            return Err(ConfigError::NoAddresses);
        }

        if let (Some(electrum), Some(http)) = (self.electrum_addr, self.http_addr) {
            if electrum == http && electrum.port() != 0 {
                return Err(ConfigError::ListenerConflict(electrum));
            }
        }

        Ok(())
    }

    pub fn has_addresses(&self) -> bool {
        !self.descriptors.is_empty() || !self.xpubs.is_empty()
    }

    /// The JSON-RPC endpoint of the backing node, defaulting to localhost on
    /// the network's standard port.
    pub fn bitcoind_url(&self) -> String {
        match &self.bitcoind_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.network.default_rpc_port()),
        }
    }

    /// Whether at least one listener is configured.
    pub fn has_servers(&self) -> bool {
        self.electrum_addr.is_some() || self.http_addr.is_some()
    }
}

/// Extended public keys may carry a `:<rescan>` suffix; only the key is
/// checked. SLIP-132 `ypub`/`zpub` (and testnet `upub`/`vpub`) are accepted
/// and checked as their plain BIP-32 equivalents.
fn validate_xpub(raw: &str, network: Network) -> Result<(), ConfigError> {
    let key = raw.split_once(':').map_or(raw, |(key, _)| key);
    let invalid = || ConfigError::InvalidXpub(raw.to_string());

    let mut data = base58::decode_check(key).map_err(|_| invalid())?;
    if data.len() != 78 {
        return Err(invalid());
    }
    let version = [data[0], data[1], data[2], data[3]];
    let canonical = if MAINNET_XPUB_VERSIONS.contains(&version) {
        XPUB_VERSION
    } else if TESTNET_XPUB_VERSIONS.contains(&version) {
        TPUB_VERSION
    } else {
        return Err(invalid());
    };
    data[..4].copy_from_slice(&canonical);

    let xpub = Xpub::decode(&data).map_err(|_| invalid())?;
    if xpub.network != network.kind() {
        return Err(ConfigError::XpubNetworkMismatch {
            xpub: raw.to_string(),
            network,
        });
    }
    Ok(())
}

/// Parse an output descriptor, verifying its checksum when one is given.
fn validate_descriptor(raw: &str) -> Result<(), ConfigError> {
    Descriptor::<DescriptorPublicKey>::from_str(raw)
        .map(|_| ())
        .map_err(|err| ConfigError::InvalidDescriptor {
            descriptor: raw.to_string(),
            reason: err.to_string(),
        })
}
