//! `bwt-daemon ping`: Electrum `server.version` handshake.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use libbwt_daemon::probe;

/// Arguments for `bwt-daemon ping`.
#[derive(Args, Debug)]
pub struct PingArgs {
    /// Address of the Electrum listener.
    pub addr: SocketAddr,

    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

impl PingArgs {
    pub fn run(self) -> Result<()> {
        let software = probe(self.addr, Duration::from_millis(self.timeout_ms))
            .with_context(|| format!("no electrum server answering on {}", self.addr))?;
        println!("{} {} ({software})", "pong".green().bold(), self.addr);
        Ok(())
    }
}
