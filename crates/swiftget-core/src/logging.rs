//! Logging setup: stderr for console runs, an XDG state file when the
//! terminal belongs to the progress bar.

use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info,swiftget=debug";

fn env_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

/// Route logs to `~/.local/state/swiftget/swiftget.log`. Returns Err when the
/// state dir or file is unusable; the caller decides what sink to use instead.
pub fn init_file_logging() -> Result<()> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("swiftget")?;
    let path = xdg_dirs
        .place_state_file("swiftget.log")
        .context("resolve log file path")?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_DIRECTIVE))
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();

    tracing::debug!(path = %path.display(), "logging to state file");
    Ok(())
}

/// Console logging. `verbose` lifts everything to debug; `quiet` keeps only
/// warnings and errors.
pub fn init_stderr_logging(verbose: bool, quiet: bool) {
    let directive = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        DEFAULT_DIRECTIVE
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(directive))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
