//! rsan is a dynamic data race detector for multithreaded programs.
//!
//! This crate is the shadow-state race-detection engine: per-thread
//! vector clocks and epochs establish happens-before across observed
//! synchronization events; a shadow cell of recent accesses backs every
//! 8 bytes of application memory; each instrumented load or store is
//! checked against the cell's history and conflicting unordered pairs
//! are reported with stacks reconstructed from per-thread event traces.
//!
//! Event production lives elsewhere: an instrumentation front-end calls
//! the functions in [`interface`] on every memory operation, function
//! boundary and synchronization event, and moves each thread's
//! [`ThreadState`] into a platform thread-local. Symbolization and
//! suppression matching are pluggable collaborators of the report
//! builder.

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod annotations;
pub mod clock;
pub mod defs;
pub mod flags;
pub mod interface;
pub mod mutex;
pub mod report;
pub mod rtl;
pub mod shadow;
pub mod shadow_mem;
pub mod stat;
pub mod sync;
pub mod thread;
pub mod trace;

pub use crate::clock::VectorClock;
pub use crate::defs::{Epoch, Tid};
pub use crate::flags::Flags;
pub use crate::report::{
    NoSuppressions, NoSymbolizer, Report, ReportFrame, ReportMop, ReportThread, ReportType,
    SuppressionEngine, Symbolizer,
};
pub use crate::rtl::{Context, ThreadState};
pub use crate::shadow::{FastState, Shadow};
pub use crate::sync::MutexCreateFlags;
pub use crate::thread::ThreadStatus;
