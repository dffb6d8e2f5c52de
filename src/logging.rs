use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_directive`. With a `log_file` the events go
/// through a non-blocking appender; the returned guard must be kept alive
/// until exit or buffered lines are lost.
pub fn init(default_directive: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive)
            .with_context(|| format!("invalid log filter {default_directive:?}"))?,
    };
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow!("log file {path:?} has no file name"))?;
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            registry
                .with(fmt::layer().with_ansi(false).with_thread_names(true).with_writer(writer))
                .try_init()
                .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            registry
                .with(
                    fmt::layer()
                        .with_thread_names(true)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow!("tracing subscriber already installed: {e}"))?;
            Ok(None)
        }
    }
}
