//! Logging and tracing configuration
//!
//! Diagnostics go to stderr so they never mix with the test runner's
//! output on stdout. An optional plain-text file layer keeps a full copy.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
///
/// `verbosity` is the number of `-v` flags minus the number of `-q` flags.
pub fn default_filter(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-1 => "testbed=warn,warn",
        0 => "testbed=info,warn",
        1 => "testbed=debug,warn",
        _ => "testbed=trace,info",
    }
}

/// Initialize tracing for the CLI
///
/// Logs are controlled by the `RUST_LOG` environment variable, falling back
/// to [`default_filter`]. When `log_file` is given, everything is also
/// written there; keep the returned guard alive until exit so it is flushed.
pub fn init_cli(verbosity: i8, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let (file_layer, guard) = match log_file.and_then(file_writer) {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn file_writer(path: &Path) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path.file_name()?;
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!("Warning: Could not create log directory {}: {}", dir.display(), e);
        return None;
    }
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}
