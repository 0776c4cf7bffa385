//! Bitcoin Core JSON-RPC access.
//!
//! The daemon never validates blocks itself. It only asks the node how far
//! its initial sync and the wallet rescan have come, through [`ChainSource`].
//! [`BitcoindRpc`] is the production implementation; tests plug in scripted
//! sources.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use libbwt_core::BwtConfig;

use crate::paths::{cookie_path, default_bitcoind_dir};

/// bitcoind is still loading its block index.
pub const RPC_IN_WARMUP: i64 = -28;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error talking to {url}: {message}")]
    Transport { url: String, message: String },

    #[error("bitcoind rejected the RPC credentials (HTTP 401)")]
    Unauthorized,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC {0} returned no result")]
    EmptyResult(&'static str),

    #[error("failed to read RPC cookie at {path}: {source}")]
    Cookie {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no RPC credentials: set bitcoind_auth, bitcoind_cookie or bitcoind_dir")]
    NoCredentials,

    #[error("malformed RPC response: {0}")]
    Decode(#[from] std::io::Error),
}

impl RpcError {
    /// Errors worth waiting out rather than failing the boot.
    pub fn is_warmup(&self) -> bool {
        matches!(self, RpcError::Rpc { code, .. } if *code == RPC_IN_WARMUP)
    }
}

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u32,
    pub headers: u32,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    #[serde(rename = "verificationprogress")]
    pub verification_progress: f64,
    #[serde(rename = "initialblockdownload")]
    pub initial_block_download: bool,
    #[serde(rename = "mediantime", default)]
    pub median_time: u64,
}

impl ChainInfo {
    /// The node is done with its initial sync.
    pub fn is_synced(&self) -> bool {
        !self.initial_block_download && self.blocks >= self.headers
    }
}

/// The `scanning` object of `getwalletinfo` while a rescan runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Seconds since the rescan started.
    pub duration: u64,
    pub progress: f64,
}

impl ScanInfo {
    /// Remaining seconds, extrapolated linearly from elapsed time.
    pub fn eta(&self) -> u32 {
        if self.progress <= 0.0 || self.progress.is_nan() {
            return 0;
        }
        let progress = self.progress.min(1.0);
        let remaining = self.duration as f64 / progress * (1.0 - progress);
        remaining.round().clamp(0.0, u32::MAX as f64) as u32
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scanning {
    Active(ScanInfo),
    Idle(#[allow(dead_code)] bool),
}

#[derive(Debug, Deserialize)]
struct WalletInfo {
    #[serde(default)]
    scanning: Option<Scanning>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

/// Where the daemon learns about node sync and wallet rescan state.
///
/// Calls are blocking; the runtime drives them from the blocking pool.
pub trait ChainSource: Send + Sync + 'static {
    fn chain_info(&self) -> Result<ChainInfo, RpcError>;

    /// `None` when no rescan is in progress.
    fn scan_info(&self) -> Result<Option<ScanInfo>, RpcError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Auth {
    UserPass(String),
    Cookie(PathBuf),
}

/// Blocking JSON-RPC client for a Bitcoin Core node.
pub struct BitcoindRpc {
    url: String,
    wallet: Option<String>,
    auth: Auth,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

impl BitcoindRpc {
    /// Build a client from the daemon config. Cookie files are re-read on
    /// every request since bitcoind rewrites them on restart.
    pub fn from_config(config: &BwtConfig) -> Result<Self, RpcError> {
        let auth = if let Some(auth) = &config.bitcoind_auth {
            Auth::UserPass(auth.clone())
        } else if let Some(cookie) = &config.bitcoind_cookie {
            Auth::Cookie(cookie.clone())
        } else {
            let dir = config
                .bitcoind_dir
                .clone()
                .or_else(default_bitcoind_dir)
                .ok_or(RpcError::NoCredentials)?;
            Auth::Cookie(cookie_path(&dir, config.network))
        };

        let agent = ureq::AgentBuilder::new().timeout(RPC_TIMEOUT).build();

        Ok(Self {
            url: config.bitcoind_url(),
            wallet: config.bitcoind_wallet.clone(),
            auth,
            agent,
            next_id: AtomicU64::new(1),
        })
    }

    fn authorization(&self) -> Result<String, RpcError> {
        let credentials = match &self.auth {
            Auth::UserPass(creds) => creds.clone(),
            Auth::Cookie(path) => std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|source| RpcError::Cookie {
                    path: path.clone(),
                    source,
                })?,
        };
        let token = base64::engine::general_purpose::STANDARD.encode(credentials);
        Ok(format!("Basic {token}"))
    }

    fn endpoint(&self, wallet_call: bool) -> String {
        match (&self.wallet, wallet_call) {
            (Some(wallet), true) => format!("{}/wallet/{}", self.url, wallet),
            _ => self.url.clone(),
        }
    }

    /// Perform one JSON-RPC call and decode its `result`.
    pub fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
        wallet_call: bool,
    ) -> Result<T, RpcError> {
        let url = self.endpoint(wallet_call);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::trace!(method, id, url = %url, "bitcoind rpc call");

        let response = match self
            .agent
            .post(&url)
            .set("Authorization", &self.authorization()?)
            .send_json(body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(401, _)) => return Err(RpcError::Unauthorized),
            // bitcoind reports RPC-level failures with a non-2xx status and a
            // regular JSON-RPC error body.
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => {
                return Err(RpcError::Transport {
                    url,
                    message: err.to_string(),
                })
            }
        };

        let decoded: RpcResponse<T> = response.into_json()?;
        if let Some(err) = decoded.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        decoded.result.ok_or(RpcError::EmptyResult(method))
    }
}

impl ChainSource for BitcoindRpc {
    fn chain_info(&self) -> Result<ChainInfo, RpcError> {
        self.call("getblockchaininfo", json!([]), false)
    }

    fn scan_info(&self) -> Result<Option<ScanInfo>, RpcError> {
        if self.wallet.is_none() {
            return Ok(None);
        }
        let info: WalletInfo = self.call("getwalletinfo", json!([]), true)?;
        Ok(match info.scanning {
            Some(Scanning::Active(scan)) => Some(scan),
            _ => None,
        })
    }
}
