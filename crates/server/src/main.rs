mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    siphon_core::config::load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = siphon_core::Config::from_env();
    cli::dispatch(config, args.command).await
}
