use anyhow::{Context, Result};
use std::{fs, path::Path};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_PREFIX: &str = "stagecraft.log";

/// Installs the global subscriber: a daily rolling file under `log_dir` and,
/// when `console` is set, a compact stderr layer.
///
/// `RUST_LOG` overrides the level picked from `verbose`. The returned guard
/// flushes the file writer on drop and must outlive every log call.
pub fn setup_logging(log_dir: &Path, verbose: bool, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;

    let file_appender = rolling::daily(log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = console.then(|| {
        let level = if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        };
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("install tracing subscriber")?;

    tracing::info!(
        dir = %log_dir.display(),
        verbose,
        console,
        "logging initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn setup_creates_log_dir() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("logs");

        // A second global init in the same test binary fails; the directory is
        // created before that point either way.
        let _ = setup_logging(&log_dir, false, false);
        assert!(log_dir.is_dir());
    }
}
