//! arduwrap: keep a serial monitor attached while compiling and flashing.
//!
//! # Usage
//!
//! ```text
//! arduwrap serve --port <port> --baud <baud> [--log-dir <dir>|--persist] [...]
//! arduwrap compile <arduino-cli compile args...>
//! arduwrap log [--clear] [--filter <regex>] [--ignore-case] [--lines <n>] [--file [--log-dir <dir>]]
//! arduwrap stop
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{compile::CompileArgs, log::LogArgs, serve::ServeArgs, ClientContext};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "arduwrap",
    version,
    about = "Serial monitor daemon that steps aside while arduino-cli flashes the board",
    long_about = None,
)]
struct Cli {
    /// Daemon socket (default: from config, else ~/.arduwrap/arduwrap.sock).
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground, monitoring one serial port.
    Serve(ServeArgs),

    /// Compile (and upload) through the daemon, which releases the port meanwhile.
    Compile(CompileArgs),

    /// Show captured serial output.
    Log(LogArgs),

    /// Ask the running daemon to shut down.
    Stop,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = ClientContext::load(cli.socket)?;
    match cli.command {
        Commands::Serve(args) => args.run(context),
        Commands::Compile(args) => args.run(&context),
        Commands::Log(args) => args.run(&context),
        Commands::Stop => commands::stop::run(&context),
    }
}
