//! Logging initialisation.
//!
//! Level and format (text or JSON) come from the `logging` section of the
//! configuration. When `logging.directory` is set, records are also appended
//! to a daily-rotated `YYYY-MM-DD.log` file in that directory.
//!
//! Returns a guard that must be kept alive until after shutdown completes so
//! that buffered log lines are flushed on exit.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::LoggingConfig;

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(config: &LoggingConfig) -> LogGuard {
    let level = parse_level(&config.level);
    let json = config.format.eq_ignore_ascii_case("json");

    let stderr_layer = if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let mut file_guard = None;
    let file_layer = config.directory.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: failed to create log directory {}: {e}",
                dir.display()
            );
            return None;
        }
        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_suffix("log")
            .build(dir);
        let appender = match appender {
            Ok(appender) => appender,
            Err(e) => {
                eprintln!("Warning: failed to open log file in {}: {e}", dir.display());
                return None;
            }
        };
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let layer = if json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .boxed()
        };
        Some(layer)
    });

    tracing_subscriber::registry()
        .with(level)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}
