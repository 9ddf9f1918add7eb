//! Thin wrapper over the `log` crate, kept around so call sites read the
//! way the rest of this codebase's ancestry does (`log!(LogDebug, ...)`)
//! instead of picking a `log::` macro by hand at each site.

use std::fs::OpenOptions;
use std::path::Path;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    LogError,
    LogWarn,
    LogNotice,
    LogDebug,
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::log::LogLevel::LogError => ::log::error!($($arg)+),
            $crate::log::LogLevel::LogWarn => ::log::warn!($($arg)+),
            $crate::log::LogLevel::LogNotice => ::log::info!($($arg)+),
            $crate::log::LogLevel::LogDebug => ::log::debug!($($arg)+),
        }
    };
}

/// Sets up the process-wide log sink. `verbosity` follows the CLI's
/// repeated `-v` count: 0 = warn, 1 = info, 2+ = debug. `quiet` forces
/// error-only output regardless of verbosity.
pub fn init(verbosity: u32, quiet: bool, log_file: Option<&Path>) {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("could not open log file '{}': {}", path.display(), e);
                eprintln!("all logging will go to stderr");
            }
        }
    }

    // init() can be called more than once in tests; ignore the "already
    // initialized" error rather than panicking.
    let _ = builder.try_init();
}
