//! Log filter selection and the rolling file sink.
//!
//! The subscriber itself is assembled by the binary; this module only decides
//! which filters apply and where the file log lives.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Appended to the file filter when the user did not pick one.
pub const FILE_DETAIL_FILTER: &str = "cfaraw_core::train=debug,cfaraw_core::validate=debug";
pub const LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "cfaraw";
const LOG_FILE_SUFFIX: &str = "log";

/// Inputs that decide the filters, gathered from CLI flags and the env.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
}

impl LogSettings {
    /// Picks up `RUST_LOG` alongside the CLI values.
    pub fn from_env(verbose: u8, cli_filter: Option<&str>) -> Self {
        Self {
            verbose,
            cli_filter: cli_filter.map(ToString::to_string),
            env_filter: std::env::var("RUST_LOG").ok(),
        }
    }

    fn is_explicit(&self) -> bool {
        self.cli_filter.is_some() || self.verbose > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    ///
    /// Unless the user chose a level, the file log also keeps per-batch
    /// detail from training and validation.
    pub fn resolve(settings: &LogSettings) -> Self {
        let console = match (&settings.cli_filter, settings.verbose, &settings.env_filter) {
            (Some(filter), _, _) => filter.clone(),
            (None, v, _) if v >= 2 => "trace".to_string(),
            (None, 1, _) => "debug".to_string(),
            (None, _, Some(filter)) if !filter.trim().is_empty() => filter.clone(),
            _ => DEFAULT_LOG_FILTER.to_string(),
        };
        let file = if settings.is_explicit() {
            console.clone()
        } else {
            format!("{console},{FILE_DETAIL_FILTER}")
        };
        Self { console, file }
    }
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// Console-only logging; `reason` is reported once the console is up.
    Unavailable {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { dir, .. } => Some(dir),
            Self::Unavailable { dir, .. } => dir.as_deref(),
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Daily rolling `cfaraw.<date>.log` files under `<data_dir>/logs`.
pub fn open_file_sink(data_dir: Option<&Path>, retention_files: usize) -> FileSink {
    let Some(data_dir) = data_dir else {
        return FileSink::Unavailable {
            dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let dir = log_dir(data_dir);
    if let Err(error) = fs::create_dir_all(&dir) {
        return FileSink::Unavailable {
            dir: Some(dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_files.max(1))
        .build(&dir);
    match built {
        Ok(appender) => FileSink::Ready { dir, appender },
        Err(error) => FileSink::Unavailable {
            dir: Some(dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}
