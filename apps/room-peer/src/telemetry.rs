use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Used when neither `--log-filter` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "warn,peer_session=info,room_peer=info";

/// Installs the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init(filter: Option<&str>, file: Option<&Path>) -> Result<WorkerGuard> {
    let filter = build_filter(filter)?;
    let (writer, guard) = open_writer(file)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(file.is_none())
                .with_writer(writer),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")?;
    Ok(guard)
}

fn build_filter(directives: Option<&str>) -> Result<EnvFilter> {
    match directives {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter {directives:?}")),
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard)> {
    match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
        None => Ok(tracing_appender::non_blocking(std::io::stderr())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_filter_must_parse() {
        assert!(build_filter(Some("debug,webrtc_ice=warn")).is_ok());
        let err = build_filter(Some("peer_session=loud")).unwrap_err();
        assert!(err.to_string().contains("peer_session=loud"));
    }

    #[test]
    fn log_file_is_created_and_missing_dirs_fail() {
        let path = std::env::temp_dir().join(format!("room-peer-log-{}.log", std::process::id()));
        let (_writer, guard) = open_writer(Some(&path)).expect("open log file");
        drop(guard);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);

        let missing = std::env::temp_dir().join("room-peer-missing-dir").join("peer.log");
        assert!(open_writer(Some(&missing)).is_err());
    }
}
