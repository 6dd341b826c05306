use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};

lazy_static! {
    static ref LOG_LEVEL: AtomicUsize = AtomicUsize::new(init_log_level() as usize);
}

/// Global log threshold for engine diagnostics. Race reports do NOT go
/// through here; they go to the report sink. This is for the engine
/// talking about itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

fn init_log_level() -> LogLevel {
    match env::var("RSAN_LOG").as_ref().map(|s| s.as_str()) {
        Ok("fatal") => LogLevel::LogFatal,
        Ok("error") => LogLevel::LogError,
        Ok("warn") => LogLevel::LogWarn,
        Ok("info") => LogLevel::LogInfo,
        Ok("debug") => LogLevel::LogDebug,
        _ => LogLevel::LogWarn,
    }
}

pub fn is_logging(level: LogLevel) -> bool {
    level as usize <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// The `verbosity` flag raises (never lowers) the effective level on
/// top of whatever `RSAN_LOG` selected. Called at context creation.
pub fn apply_verbosity(verbosity: u64) {
    let raised = match verbosity {
        0 => return,
        1 => LogLevel::LogInfo,
        _ => LogLevel::LogDebug,
    };
    LOG_LEVEL.fetch_max(raised as usize, Ordering::Relaxed);
}

macro_rules! log {
    ($lvl:expr, $($arg:tt)*) => {
        if crate::log::is_logging($lvl) {
            eprintln!("[rsan {:?}] {}", $lvl, format_args!($($arg)*));
        }
    };
}

/// Engine invariant violation or resource exhaustion. Prints a
/// diagnostic and aborts the process; the instrumented program must not
/// continue on corrupted detector state.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("[rsan FATAL] {}", format_args!($($arg)*));
        ::std::process::abort();
    }};
}
