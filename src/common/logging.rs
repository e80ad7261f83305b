//! Logging and tracing configuration
//!
//! Console logging goes to stderr so command output on stdout stays clean.
//! A run can additionally log to `harness.log` inside its run directory.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable. Default
/// level is INFO for this crate (DEBUG when `verbose`), WARN for
/// dependencies. When `run_dir` is given, logs are also appended to
/// `harness.log` there; keep the returned guard alive until exit so the
/// file writer flushes.
pub fn init_cli(verbose: bool, run_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("harness=debug,warn")
        } else {
            EnvFilter::new("harness=info,warn")
        }
    });

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let Some(dir) = run_dir.filter(|d| std::fs::create_dir_all(d).is_ok()) else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    let appender = tracing_appender::rolling::never(dir, "harness.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

/// Mask values of credential-looking environment keys
pub fn redact<'a>(key: &str, value: &'a str) -> &'a str {
    let upper = key.to_ascii_uppercase();
    let sensitive = ["TOKEN", "PAT", "PASSWORD", "SECRET"]
        .iter()
        .any(|marker| upper.contains(marker));
    if sensitive && !value.is_empty() {
        "***"
    } else {
        value
    }
}
