use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unionfs::fs::fuse::FuseDaemon;
use unionfs::{MountOptions, Source, UnionFs};

/// Mounts a union of several backing directories at one mountpoint.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Comma-separated list of backing directories, in priority order.
    #[arg(value_delimiter = ',')]
    sources: Vec<PathBuf>,

    /// Where to mount the union.
    mountpoint: PathBuf,

    /// Comma-separated FUSE mount options (e.g. `allow_other,ro`).
    #[arg(short = 'o', long, default_value = "")]
    options: String,

    /// Number of FUSE worker threads to spawn.
    #[arg(long, env, default_value_t = default_threads())]
    threads: usize,

    /// A global log level to use when printing logs.
    #[arg(long)]
    log_level: Option<Level>,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(4)
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

    if cli.sources.is_empty() {
        return Err("at least one source directory is required".into());
    }

    let options = MountOptions::parse(&cli.options)?;
    let sources = cli.sources.iter().cloned().map(Source::new).collect();

    let fs = UnionFs::new(sources, cli.mountpoint.clone())?;

    info!(mountpoint = ?cli.mountpoint, sources = ?cli.sources, "mounting union filesystem");
    let daemon = Arc::new(Mutex::new(FuseDaemon::new(
        fs,
        &cli.mountpoint,
        cli.threads,
        &options,
    )?));

    let shutdown = daemon.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, unmounting…");
        if let Err(error) = shutdown.lock().unwrap().unmount() {
            tracing::error!(?error, "failed to unmount");
        }
        std::process::exit(0);
    })?;

    // The daemon's worker threads run independently; park this thread so the
    // process stays alive to receive the signal above.
    loop {
        std::thread::park();
    }
}
