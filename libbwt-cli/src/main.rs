//! bwt-daemon: run and inspect a bwt daemon from the command line.
//!
//! # Usage
//!
//! ```text
//! bwt-daemon run --config <file> [--electrum-addr <addr>] [--http-addr <addr>] [-v...]
//! bwt-daemon check-config <file> [--json]
//! bwt-daemon test-rpc --config <file>
//! bwt-daemon ping <addr> [--timeout-ms <ms>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::{CheckConfigArgs, TestRpcArgs},
    ping::PingArgs,
    run::RunArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "bwt-daemon",
    version,
    about = "Bitcoin wallet tracker daemon",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot the daemon in the foreground until interrupted.
    Run(RunArgs),

    /// Parse and validate a JSON config file without starting anything.
    CheckConfig(CheckConfigArgs),

    /// Check that the configured bitcoind answers RPC calls.
    TestRpc(TestRpcArgs),

    /// Handshake with a running Electrum listener.
    Ping(PingArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::CheckConfig(args) => args.run(),
        Commands::TestRpc(args) => args.run(),
        Commands::Ping(args) => args.run(),
    }
}
