use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unionfs::{Balancer, Source};

/// Rebalances the top-level entries of a set of union filesystem sources so
/// their used space is as even as possible.
///
/// Run this offline: the sources must be quiescent (the union unmounted, or
/// otherwise not being written to) for the result to be meaningful.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Comma-separated list of backing directories, in priority order.
    #[arg(value_delimiter = ',')]
    sources: Vec<PathBuf>,

    /// Compute and log the moves that would be made, without performing them.
    #[arg(long)]
    dry_run: bool,

    /// A global log level to use when printing logs.
    #[arg(long)]
    log_level: Option<Level>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = cli.log_level.unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().compact().with_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            ),
        )
        .init();

    if cli.sources.len() < 2 {
        return Err("balancing requires at least two source directories".into());
    }

    let sources = cli.sources.into_iter().map(Source::new).collect();
    let balancer = Balancer::new(sources);

    let moves = balancer.balance(cli.dry_run)?;
    info!(count = moves.len(), dry_run = cli.dry_run, "balance complete");
    for mv in &moves {
        info!(name = ?mv.name, from = %mv.from.display(), to = %mv.to.display(), size = mv.size, "move");
    }

    Ok(())
}
