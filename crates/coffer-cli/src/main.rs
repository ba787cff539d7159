#![warn(missing_docs)]

//! `coffer` binary entry point.

use anyhow::Result;
use clap::Parser;
use coffer_cli::{logging, Cli};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let (config, missing) = cli.load_config()?;

    logging::init(config.log_format);
    if let Some(path) = missing {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
    }
    tracing::debug!(repository = %config.repository.display(), "coffer starting");

    let code = cli.run(config).await?;
    Ok(ExitCode::from(code))
}
