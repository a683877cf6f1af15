use anyhow::{Context, Result};
use tracing::{error, info};

mod cli;

use crawlhook::utils::{build_dispatch, default_log_file};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    // Initialize logging
    let log_file = match &args.log_file {
        Some(Some(path)) => Some(path.clone()),
        Some(None) => Some(default_log_file()),
        None => None,
    };
    let dispatch = build_dispatch(args.verbose, log_file)?;
    tracing::dispatcher::set_global_default(dispatch.clone())
        .context("Failed to install the log subscriber")?;

    info!("Starting crawlhook v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args, dispatch).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
