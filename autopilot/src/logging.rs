//! Diagnostic tracing for the autopilot binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator diagnostics via `RUST_LOG`, written to
//!   stderr and optionally teed to `<log_dir>/autopilot.log`.
//!
//! - **Round artifacts (`io/history`, `io/transcript`, `io/bootstrap`)**:
//!   product output under the log directory. Always written, unaffected by
//!   `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE: &str = "autopilot.log";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `info`. Output: stderr, compact format,
/// plus an appended plain-text file when `log_dir` is given.
///
/// # Example
/// ```bash
/// RUST_LOG=autopilot=debug autopilot run --once
/// ```
pub fn init(log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}
