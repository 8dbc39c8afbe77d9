//! Tracing subscriber setup.
//!
//! The CLI calls [`init`] once; the library only emits events. Filtering
//! follows `RUST_LOG` (default `info`), so
//! `RUST_LOG=xbasemesh::runner=debug` narrows to one subsystem. With an
//! output directory, a non-blocking appender mirrors everything into
//! `<output>/xbasemesh.log`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging. Keep the returned guard alive for the process
/// lifetime; dropping it flushes and stops the file writer.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::rfc_3339())
        .with_target(true);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "xbasemesh.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
