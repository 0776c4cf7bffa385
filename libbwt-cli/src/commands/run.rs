//! `bwt-daemon run`: foreground daemon with lifecycle events on stdout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use libbwt_core::{BwtConfig, DaemonEvent};
use libbwt_daemon::{init_logging, spawn, BitcoindRpc, DaemonRegistry, RunningDaemon};

/// Arguments for `bwt-daemon run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// JSON config file.
    #[arg(long, short)]
    pub config: PathBuf,

    /// Override `electrum_addr` from the config.
    #[arg(long)]
    pub electrum_addr: Option<SocketAddr>,

    /// Override `http_addr` from the config.
    #[arg(long)]
    pub http_addr: Option<SocketAddr>,

    /// Increase log verbosity (repeatable). Added to the config's `verbose`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let mut config = BwtConfig::from_file(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))?;
        if let Some(addr) = self.electrum_addr {
            config.electrum_addr = Some(addr);
        }
        if let Some(addr) = self.http_addr {
            config.http_addr = Some(addr);
        }
        config.verbose += usize::from(self.verbose);
        config
            .validate()
            .context("config invalid after applying overrides")?;

        init_logging(config.verbose);
        let source = Arc::new(
            BitcoindRpc::from_config(&config).context("failed to set up bitcoind RPC client")?,
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;

        runtime.block_on(async move {
            let registry = DaemonRegistry::new();
            let RunningDaemon {
                mut events,
                mut task,
            } = spawn(&registry, config, source);
            let mut events_open = true;

            loop {
                tokio::select! {
                    event = events.recv(), if events_open => match event {
                        Some(event) => print_event(&event),
                        None => events_open = false,
                    },
                    joined = &mut task => {
                        joined.context("daemon task panicked")?.context("daemon exited with error")?;
                        println!("{}", "bwt stopped".bright_black());
                        return Ok(());
                    }
                    signal = tokio::signal::ctrl_c() => {
                        signal.context("failed to listen for ctrl-c")?;
                        tracing::info!("interrupt received");
                        println!("{}", "shutting down...".yellow());
                        registry.shutdown_all();
                    }
                }
            }
        })
    }
}

fn print_event(event: &DaemonEvent) {
    match event {
        DaemonEvent::Booting { handle } => {
            println!("{} daemon {handle}", "booting".cyan().bold())
        }
        DaemonEvent::SyncProgress {
            progress,
            tip_height,
        } => println!(
            "{} {:>6.2}% (height {tip_height})",
            "sync".blue(),
            progress * 100.0
        ),
        DaemonEvent::ScanProgress { progress, eta } => println!(
            "{} {:>6.2}% (eta {eta}s)",
            "scan".magenta(),
            progress * 100.0
        ),
        DaemonEvent::ElectrumReady { addr } => {
            println!("{} electrum server on {addr}", "listening".green())
        }
        DaemonEvent::HttpReady { addr } => {
            println!("{} http server on {addr}", "listening".green())
        }
        DaemonEvent::Ready => println!("{}", "bwt is ready".green().bold()),
    }
}
