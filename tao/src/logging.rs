//! Tracing subscriber installation driven by the `tao.log` config section.

use std::path::Path;
use std::sync::OnceLock;

use tao_shared::{ErrorCode, TaoError, TaoResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Keeps the file writer flushing for the lifetime of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber described by `config`.
///
/// Safe to call multiple times; only the first successful call installs
/// anything. A subscriber installed by the host beforehand also wins.
///
/// # Environment Variables
///
/// - `RUST_LOG`: overrides `config.level` when set and non-empty
pub fn init_logging(config: &LogConfig) -> TaoResult<()> {
    if config.disable {
        return Ok(());
    }
    if INSTALLED.get().is_some() {
        tracing::debug!("Logging already initialized");
        return Ok(());
    }

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(&config.level).map_err(|e| {
            TaoError::new(
                ErrorCode::ParamInvalid,
                format!("log: invalid level {}: {e}", config.level),
            )
        })?,
    };

    let mut file_writer = None;
    let mut file_guard = None;
    if config.output.file() {
        let (writer, guard) = file_appender(Path::new(&config.path))?;
        file_writer = Some(writer);
        file_guard = Some(guard);
    }

    let console_layer = config
        .output
        .console()
        .then(|| fmt::layer().with_writer(std::io::stdout));
    let file_layer = file_writer.map(|w| fmt::layer().with_writer(w).with_ansi(false));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => {
            let _ = INSTALLED.set(());
            if let Some(guard) = file_guard {
                let _ = LOG_GUARD.set(guard);
            }
            tracing::debug!(level = %config.level, output = ?config.output, "Logging initialized");
        }
        Err(e) => {
            tracing::debug!("Global subscriber already set, keeping it: {}", e);
        }
    }
    Ok(())
}

fn file_appender(
    path: &Path,
) -> TaoResult<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_name = path.file_name().ok_or_else(|| {
        TaoError::new(
            ErrorCode::ParamInvalid,
            format!("log: {} is not a file path", path.display()),
        )
    })?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    std::fs::create_dir_all(dir)
        .map_err(|e| TaoError::wrapped("init: fail to open log file", TaoError::from(e)))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogOutput;

    #[test]
    fn test_disabled_logging_is_noop() {
        let config = LogConfig {
            disable: true,
            ..LogConfig::default()
        };
        init_logging(&config).unwrap();
    }

    #[test]
    fn test_init_twice_is_noop() {
        let config = LogConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("tao.log");
        let (_writer, _guard) = file_appender(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_file_appender_rejects_directory_path() {
        let err = file_appender(Path::new("/")).unwrap_err();
        assert_eq!(err.code(), &ErrorCode::ParamInvalid);
    }

    #[test]
    fn test_output_flags() {
        assert!(LogOutput::Console.console());
        assert!(!LogOutput::Console.file());
        assert!(LogOutput::File.file());
    }
}
