use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod logging;

use cli::Args;
use flowtrace::trace::{probe_from_file, probe_from_reader};

fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    logging::init_tracing(args.verbose)?;
    let config = args.to_config()?;

    // Fatal setup errors (socket open, interface not found, malformed
    // prefix file) propagate and flip the exit code; per-probe send
    // failures only show up in the statistics.
    let (prober_stats, sniffer_stats) = match &config.input_file {
        Some(path) => probe_from_file(&config, path)
            .with_context(|| format!("probing from {}", path.display()))?,
        None => {
            let stdin = std::io::stdin();
            probe_from_reader(&config, stdin.lock()).context("probing from stdin")?
        }
    };

    println!("{}", prober_stats);
    println!("{}", sniffer_stats);
    Ok(())
}
