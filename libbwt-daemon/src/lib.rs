//! bwt daemon lifecycle: boot against bitcoind, wait for sync and rescan,
//! bring up the configured listeners and stay up until shut down.

pub mod bitcoind;
mod error;
mod logging;
mod notifier;
pub mod paths;
mod progress;
pub mod protocol;
mod registry;
mod runtime;
mod servers;
pub mod webhooks;

pub use bitcoind::{BitcoindRpc, ChainInfo, ChainSource, RpcError, ScanInfo};
pub use error::DaemonError;
pub use logging::{default_filter, init_logging};
pub use notifier::{ChannelNotifier, NoopNotifier, Notifier};
pub use protocol::{probe, send_request, ElectrumRequest, ElectrumResponse};
pub use registry::{DaemonRegistry, InstanceStatus};
pub use runtime::{run, shutdown, spawn, start, start_with_source, test_rpc, RunningDaemon};
