//! Domain types shared by the daemon runtime and its callers.
//!
//! Everything here is plain data: no I/O, no async. All types that cross the
//! status endpoint are serializable via serde.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for one live daemon instance.
///
/// Issued by the handle registry when an instance boots and handed to the
/// caller through `on_booting`. Ids are never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShutdownHandle(pub u64);

impl fmt::Display for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ShutdownHandle {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Bitcoin network the backing node runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    #[serde(alias = "mainnet")]
    Bitcoin,
    Testnet,
    Regtest,
    Signet,
}

impl Network {
    /// Default bitcoind JSON-RPC port.
    pub fn default_rpc_port(self) -> u16 {
        match self {
            Network::Bitcoin => 8332,
            Network::Testnet => 18332,
            Network::Regtest => 18443,
            Network::Signet => 38332,
        }
    }

    /// Which family of extended key versions this network uses.
    pub fn kind(self) -> bitcoin::NetworkKind {
        match self {
            Network::Bitcoin => bitcoin::NetworkKind::Main,
            _ => bitcoin::NetworkKind::Test,
        }
    }

    /// Sub-directory of the bitcoind data dir holding this network's files.
    /// Mainnet lives at the root.
    pub fn data_subdir(self) -> Option<&'static str> {
        match self {
            Network::Bitcoin => None,
            Network::Testnet => Some("testnet3"),
            Network::Regtest => Some("regtest"),
            Network::Signet => Some("signet"),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "bitcoin"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
            Network::Signet => write!(f, "signet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            other => Err(format!(
                "unknown network '{other}'; expected: bitcoin, testnet, regtest, signet"
            )),
        }
    }
}

/// Lifecycle of a daemon instance.
///
/// `Uninitialized → Starting → Running → ShuttingDown → Stopped`. A shutdown
/// may also be requested while still `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    #[default]
    Uninitialized,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl DaemonState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Uninitialized, Starting)
                | (Starting, Running)
                | (Starting, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
                // Boot failures skip straight to Stopped.
                | (Starting, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Stopped)
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DaemonState::Uninitialized => "uninitialized",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::ShuttingDown => "shutting_down",
            DaemonState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// The two listeners a daemon can bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Electrum,
    Http,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Electrum => write!(f, "electrum"),
            ServerKind::Http => write!(f, "http"),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress + events
// ---------------------------------------------------------------------------

/// A progress sample emitted while the daemon boots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Progress {
    /// Node initial sync. `tip_height` is the node's current block height.
    Sync { progress: f32, tip_height: u32 },
    /// Wallet rescan. `eta` is the estimated number of seconds remaining.
    Scan { progress: f32, eta: u32 },
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        match self {
            Progress::Sync { progress, .. } | Progress::Scan { progress, .. } => *progress,
        }
    }
}

/// Clamp a raw progress reading into `[0, 1]`. NaN reads as zero.
pub fn clamp_progress(raw: f64) -> f32 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 1.0) as f32
}

/// One lifecycle notification, in the order the daemon emits them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DaemonEvent {
    Booting { handle: ShutdownHandle },
    SyncProgress { progress: f32, tip_height: u32 },
    ScanProgress { progress: f32, eta: u32 },
    ElectrumReady { addr: SocketAddr },
    HttpReady { addr: SocketAddr },
    Ready,
}

impl From<Progress> for DaemonEvent {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Sync { progress, tip_height } => {
                DaemonEvent::SyncProgress { progress, tip_height }
            }
            Progress::Scan { progress, eta } => DaemonEvent::ScanProgress { progress, eta },
        }
    }
}
