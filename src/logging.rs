//! Structured logging setup (console + daily rolling file).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,repair_minder_sync=debug";
const DEFAULT_PREFIX: &str = "repair-minder-sync";
const MAX_LOG_FILES: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed: {0}")]
    Init(#[from] TryInitError),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for rolling log files. Console only when `None`.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Number of daily files kept on startup.
    pub keep_files: usize,
    /// JSON lines instead of plain text in the file layer.
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: DEFAULT_PREFIX.to_string(),
            keep_files: MAX_LOG_FILES,
            json: false,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer when dropped; the host keeps
/// it alive for the life of the process.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>, LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let console_layer = fmt::layer().with_target(true);

    let mut guard = None;
    let mut text_file_layer = None;
    let mut json_file_layer = None;

    if let Some(dir) = &options.log_dir {
        fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
            path: dir.clone(),
            source,
        })?;
        prune_old_logs(dir, &options.file_prefix, options.keep_files);

        let file_appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        if options.json {
            json_file_layer = Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            );
        } else {
            text_file_layer = Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            );
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init()?;

    Ok(guard)
}

/// Delete all but the newest `keep` files starting with `prefix`. Returns
/// the number removed.
pub fn prune_old_logs(dir: &Path, prefix: &str, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let name = path.file_name()?.to_str()?.to_string();
            if !name.starts_with(prefix) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified, name))
        })
        .collect();

    // newest first; daily names sort by date when mtimes tie
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.2.cmp(&a.2)));

    let mut removed = 0;
    for (path, _, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
