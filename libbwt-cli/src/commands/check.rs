//! `bwt-daemon check-config` and `bwt-daemon test-rpc`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use libbwt_core::BwtConfig;
use libbwt_daemon::{init_logging, test_rpc};

/// Arguments for `bwt-daemon check-config`.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// JSON config file.
    pub config: PathBuf,

    /// Print the normalized config (defaults filled in) as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckConfigArgs {
    pub fn run(self) -> Result<()> {
        let config = BwtConfig::from_file(&self.config)
            .with_context(|| format!("invalid config {}", self.config.display()))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("failed to render config JSON")?
            );
            return Ok(());
        }

        println!("{} {}", "config ok:".green().bold(), self.config.display());
        println!("  network      {}", config.network);
        println!("  bitcoind     {}", config.bitcoind_url());
        if let Some(wallet) = &config.bitcoind_wallet {
            println!("  wallet       {wallet}");
        }
        println!(
            "  tracking     {} xpub(s), {} descriptor(s)",
            config.xpubs.len(),
            config.descriptors.len()
        );
        println!("  electrum     {}", describe_addr(config.electrum_addr));
        println!("  http         {}", describe_addr(config.http_addr));
        if !config.webhooks_urls.is_empty() {
            println!("  webhooks     {}", config.webhooks_urls.len());
        }
        Ok(())
    }
}

fn describe_addr(addr: Option<std::net::SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        None => "disabled".bright_black().to_string(),
    }
}

/// Arguments for `bwt-daemon test-rpc`.
#[derive(Args, Debug)]
pub struct TestRpcArgs {
    /// JSON config file.
    #[arg(long, short)]
    pub config: PathBuf,
}

impl TestRpcArgs {
    pub fn run(self) -> Result<()> {
        let config = BwtConfig::from_file(&self.config)
            .with_context(|| format!("invalid config {}", self.config.display()))?;
        init_logging(config.verbose);

        let info = test_rpc(&config)
            .with_context(|| format!("bitcoind at {} is not usable", config.bitcoind_url()))?;

        let sync = if info.is_synced() {
            "synced".green()
        } else {
            format!("syncing {:.2}%", info.verification_progress * 100.0).yellow()
        };
        println!(
            "{} {} at height {} ({sync})",
            "bitcoind ok:".green().bold(),
            info.chain,
            info.blocks
        );
        Ok(())
    }
}
