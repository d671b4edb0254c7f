use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chess_trolley_runtime::runtime::{self, Options};

/// Drive the chess trolley from moves given on stdin ("e2e4", one per line)
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON configuration file (defaults are used for anything missing)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the driver bus
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baudrate: Option<u32>,

    /// Run on simulated drivers and pins
    #[arg(long)]
    simulate: bool,

    /// Assume the trolley already sits on h8
    #[arg(long)]
    skip_calibration: bool,
}

fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = Options {
        config: cli.config,
        port: cli.port,
        baudrate: cli.baudrate,
        simulate: cli.simulate,
        skip_calibration: cli.skip_calibration,
    };

    if let Err(e) = runtime::run(options) {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
