//! Cairn CLI: declarative infrastructure convergence.

use cairn::CancelToken;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cairn",
    version,
    about = "Declarative infrastructure convergence: declare, order, inspect, apply what differs"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: cairn::cli::Commands,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "cairn=info",
        1 => "cairn=debug",
        _ => "cairn=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("interrupt received, finishing in-flight resources");
        handler.cancel();
    }) {
        warn!(error = %e, "cannot install interrupt handler");
    }

    if let Err(e) = cairn::cli::dispatch(cli.command, cancel) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
