use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::Dispatch;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "crawlhook=debug" } else { "crawlhook=info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive("warn".parse()?))
}

/// Build the log dispatcher used by the CLI and handed to the engine
///
/// Logs go to stderr, and additionally to `log_file` without ANSI colors
/// when one is given.
pub fn build_dispatch(verbose: bool, log_file: Option<PathBuf>) -> Result<Dispatch> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let registry = tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(fmt_layer);

    let Some(log_file) = log_file else {
        return Ok(Dispatch::new(registry));
    };

    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .context(format!("Failed to create log directory: {}", parent.display()))?;
    }
    let file = fs::File::create(&log_file)
        .context(format!("Failed to create log file: {}", log_file.display()))?;
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(file);

    Ok(Dispatch::new(registry.with(file_layer)))
}

/// Create a default log file path
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawlhook", "crawlhook") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("crawlhook.log");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging() {
        let path = std::env::temp_dir()
            .join(format!("crawlhook-log-{}", uuid::Uuid::new_v4()))
            .join("run.log");

        let dispatch = build_dispatch(true, Some(path.clone())).unwrap();
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!(target: "crawlhook", "file logging works");
        });

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("file logging works"));
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_default_log_file_name() {
        assert!(default_log_file().ends_with("crawlhook.log"));
    }
}
