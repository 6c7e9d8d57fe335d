//! Logging setup for conductor.
//!
//! Log levels:
//! - ERROR: Failures that end a run or lose a record
//! - WARN: Recoverable conditions (failed attempts, degraded escalations)
//! - INFO: Run and batch lifecycle
//! - DEBUG: Supervisor decisions and stage invocations
//! - TRACE: Stage payloads
//!
//! Debug mode can be enabled with the `--debug` flag or `CONDUCTOR_DEBUG=1`.
//! `RUST_LOG` takes precedence over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Returns true when `CONDUCTOR_DEBUG` asks for debug output.
pub fn debug_from_env() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Level used when `RUST_LOG` is unset.
pub fn default_level(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Location of the log file, `~/.conductor/conductor.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor").join("conductor.log"))
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    std::fs::create_dir_all(path.parent()?).ok()?;
    // Truncated on startup
    File::create(path).ok()
}

/// Install the global subscriber.
///
/// Writes to the log file when it can be opened, otherwise to stderr.
/// Calling this more than once is harmless.
pub fn init(debug: bool) {
    let level = default_level(debug || debug_from_env());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match open_log_file() {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
