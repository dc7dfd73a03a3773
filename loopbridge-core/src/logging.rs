//! File logging for the bridge process.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use log::LevelFilter;
use simplelog::{ConfigBuilder, WriteLogger};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log file: {0}")]
    Io(#[from] io::Error),
    #[error("logger already installed: {0}")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// `<config_dir>/loopbridge/loopbridge.log`, or the temp dir when there is
/// no config dir.
pub fn log_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("loopbridge"))
        .unwrap_or_else(std::env::temp_dir)
        .join("loopbridge.log")
}

/// Install a file logger. `Debug` when verbose, otherwise `Warn`.
///
/// Returns the path actually written to.
pub fn init_logging(verbose: bool) -> Result<PathBuf, LoggingError> {
    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };

    let mut log_path = log_path();
    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let log_file = match File::create(&log_path) {
        Ok(file) => file,
        Err(_) => {
            log_path = std::env::temp_dir().join("loopbridge.log");
            File::create(&log_path)?
        }
    };

    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .build();
    WriteLogger::init(log_level, config, log_file)?;

    log::info!("loopbridge starting (log level: {:?})", log_level);
    Ok(log_path)
}
