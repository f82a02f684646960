//! # Logging Initialization
//!
//! Centralized setup for the `tracing` ecosystem. Call [`init_logging`] once at the start of
//! `main`; repeated calls are ignored thanks to a `std::sync::Once`.
//!
//! - **Environment Filter**: `RUST_LOG` wins when set; otherwise the given level applies to
//!   everything and `fnexec` itself logs at `debug`.
//! - **File Logging (default)**: a daily rolling file in the user cache directory (resolved
//!   with `directories`), written through `tracing_appender`'s non-blocking writer, no ANSI.
//! - **Stderr Logging**: when `log_to_file` is false, or when the cache directory cannot be
//!   used, logs go to stderr with ANSI colors.
//!
//! Execution events emitted by [`crate::events::LoggingEventSink`] flow through the same
//! subscriber under the `fnexec::events` target.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    // Tests share one subscriber; ignore the error if another test already installed one.
    let _ = init_logging("trace", false);
}

fn init_stderr(env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layer().with_writer(stderr).with_ansi(true))
        .try_init();
}

/// Initializes the logging system.
///
/// When logging to stderr, ANSI colors are enabled. When logging to file, ANSI colors are
/// disabled. A failure to create the log directory falls back to stderr instead of failing.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},fnexec=debug")));

        if !log_to_file {
            init_stderr(env_filter);
            return;
        }

        let Some(proj_dirs) = ProjectDirs::from("com", "Fnexec", "fnexec") else {
            init_stderr(env_filter);
            return;
        };

        let log_dir = proj_dirs.cache_dir();
        if std::fs::create_dir_all(log_dir).is_err() {
            init_stderr(env_filter);
            return;
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "fnexec.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(non_blocking).with_ansi(false))
            .try_init();
        // The guard is intentionally leaked to ensure logs are flushed on exit.
        Box::leak(Box::new(guard));
    });

    Ok(())
}
