use clap::Parser;
use color_eyre::Result;
use real_slim_proxy::{config, logging, server};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "real-slim-proxy")]
#[command(about = "A dependency caching proxy with object-store artifact storage")]
#[command(
  long_about = "A dependency caching proxy with object-store artifact storage.\n\
                Designed to run as a sidecar in ephemeral build environments so \
                repeated builds do not repeat internet downloads."
)]
#[command(version)]
struct Args {
  /// Path to config file (default: ./slim.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Verbose logging
  #[arg(short, long)]
  verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(args.verbose, config.log_file.as_deref())?;
  debug!(?config, "Config read");

  server::run(config).await
}
