use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use xray_cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter)),
        )
        .init();
    run_cli(cli)
}
