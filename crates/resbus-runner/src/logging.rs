use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{APP_NAME, paths::ProjectPaths};

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component.
///
/// - `component_name`: used for the log file name (e.g. "server", "runner")
/// - `file`: also write to `<data_dir>/logs/<component_name>.log`
///
/// `RUST_LOG` overrides the default `info` filter. The returned guard must be kept
/// alive for as long as file logging is wanted.
pub fn init_logging(component_name: &str, file: bool) -> io::Result<Option<WorkerGuard>> {
    let log_dir = if file { Some(log_directory()?) } else { None };
    init_logging_in(component_name, log_dir.as_deref())
}

/// Like [`init_logging`], writing the log file into `log_dir` when one is given
pub fn init_logging_in(
    component_name: &str,
    log_dir: Option<&Path>,
) -> io::Result<Option<WorkerGuard>> {
    let Some(log_dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .try_init()
            .map_err(io::Error::other)?;
        return Ok(None);
    };

    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(format!("{}.log", component_name));

    truncate_if_needed(&log_path)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(target: "runner", "Logging to file: {}", log_path.display());

    Ok(Some(guard))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_directory() -> io::Result<PathBuf> {
    let paths = ProjectPaths::new(APP_NAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;

    Ok(paths.data_dir().join("logs"))
}

/// Start the file over once it grows past MAX_LOG_SIZE
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        let file = File::create(log_path)?;
        file.set_len(0)?;
    }
    Ok(())
}
