use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Wires up the tracing subscriber: human-readable console output plus a
/// daily-rotated JSON file under `logs/`.
///
/// The returned guard owns the background log writer; hold it for the life of
/// the process so buffered lines are flushed on exit.
pub fn init_logging() -> WorkerGuard {
    let _ = fs::create_dir_all("logs");

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily("logs", "afisha.log"));

    let filter = EnvFilter::from_default_env()
        .add_directive("afisha_pipeline=info".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(file_writer))
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    guard
}
