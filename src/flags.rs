use crate::log::LogLevel::LogWarn;
use std::env;
use std::ffi::OsString;
use std::iter;
use std::path::PathBuf;
use structopt::StructOpt;

/// Runtime flags of the detector.
///
/// Parsed from the whitespace-split `RSAN_OPTIONS` environment variable,
/// so an uninstrumented launcher can still configure an instrumented
/// binary. A malformed option string is reported and the defaults are
/// used; the instrumented program must keep running.
#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "rsan")]
pub struct Flags {
    /// Report detail level (0-3).
    #[structopt(long, default_value = "0")]
    pub verbosity: u64,
    /// Trace depth per thread, in parts. Rounded up to a power of two.
    #[structopt(long, default_value = "8")]
    pub history_size: usize,
    /// Stop emitting race reports after this many; keep counting.
    #[structopt(long, default_value = "1000")]
    pub max_reported_races: usize,
    /// Path to a suppression file, consumed by the external suppression
    /// engine.
    #[structopt(long, parse(from_os_str))]
    pub suppressions: Option<PathBuf>,
    /// Enable lock-order inversion warnings (consumed by an external
    /// collaborator, not by this engine).
    #[structopt(long)]
    pub track_lock_orders: bool,
    /// File of `0xSTART-0xEND` address ranges whose races are ignored.
    #[structopt(long, parse(from_os_str))]
    pub ignore_regions: Option<PathBuf>,
    /// Process exit status when at least one race was reported.
    #[structopt(long, default_value = "66")]
    pub exit_status_on_race: i32,
    /// Emit reports as JSON instead of text.
    #[structopt(long)]
    pub structured_reports: bool,
}

impl Flags {
    pub fn from_env() -> Flags {
        let opts = env::var("RSAN_OPTIONS").unwrap_or_default();
        let args = iter::once(OsString::from("rsan"))
            .chain(opts.split_whitespace().map(OsString::from));
        match Flags::from_iter_safe(args) {
            Ok(flags) => flags,
            Err(e) => {
                log!(LogWarn, "malformed RSAN_OPTIONS, using defaults: {}", e);
                Flags::default()
            }
        }
    }

    /// Number of trace parts per thread after normalization.
    pub fn trace_parts(&self) -> usize {
        self.history_size.max(1).next_power_of_two()
    }
}

impl Default for Flags {
    fn default() -> Flags {
        // No arguments: every field takes its declared default.
        match Flags::from_iter_safe(iter::once(OsString::from("rsan"))) {
            Ok(flags) => flags,
            Err(_) => fatal!("inconsistent flag defaults"),
        }
    }
}
