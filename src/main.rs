use anyhow::Result;
use clap::Parser;
use stagecraft::{cli, logging};

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let _guard = logging::setup_logging(&cli::log_dir(&args)?, args.verbose, true)?;
    if let Err(err) = cli::run(args) {
        tracing::error!("{err:#}");
        return Err(err);
    }
    Ok(())
}
