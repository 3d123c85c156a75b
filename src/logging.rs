//! Logger setup for the terminal host.

use std::fs::OpenOptions;
use std::io::Write;

pub const DEBUG_LOG_FILE: &str = "debug.log";

/// How much the logger should say and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Full debug output appended to `debug.log`; the terminal stays clean.
    DebugFile,
    /// Raw-mode TUI on screen: only errors reach stderr.
    Interactive,
    /// Plain command-line run.
    Batch,
}

/// Initialize the logger. `RUST_LOG` still overrides the level.
///
/// Lines start with `\r` so they stay readable when the terminal is in raw
/// mode.
pub fn init_logger(mode: LogMode) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(match mode {
        LogMode::DebugFile => log::LevelFilter::Debug,
        LogMode::Interactive => log::LevelFilter::Error,
        LogMode::Batch => log::LevelFilter::Info,
    });
    builder.parse_default_env();
    builder.format(|buf, record| {
        writeln!(
            buf,
            "\r[{} {:5} {}] {}",
            buf.timestamp(),
            record.level(),
            record.module_path().unwrap_or("unknown"),
            record.args()
        )
    });

    if mode == LogMode::DebugFile {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(DEBUG_LOG_FILE)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Could not open {}: {}", DEBUG_LOG_FILE, e),
        }
    }

    if builder.try_init().is_err() {
        log::warn!("Logger already initialized");
    }
}
