use static_assertions::const_assert;

/// Thread identifier. Small, dense, reused after a thread is reaped
/// (see `reuse_count` on `ThreadContext` for stale-reference detection).
pub type Tid = u32;

/// Per-thread monotone logical time. Incremented on every instrumented
/// memory access and every synchronization event.
pub type Epoch = u64;

/// Width of the tid field in a shadow word.
pub const TID_BITS: usize = 16;

/// Width of the epoch field in a shadow word.
pub const CLK_BITS: usize = 42;

/// Number of shadow words per 8-byte application cell.
pub const SHADOW_CNT: usize = 4;

/// Events per trace part. The part count comes from `Flags::history_size`.
pub const TRACE_PART_SIZE: usize = 1024;

/// Default number of trace parts per thread.
pub const DEFAULT_TRACE_PARTS: usize = 8;

/// Maximum depth of a reconstructed stack.
pub const MAX_STACK: usize = 64;

pub const MAX_TID: Tid = (1u64 << TID_BITS) as Tid;
pub const MAX_EPOCH: Epoch = (1u64 << CLK_BITS) - 1;

/// Finished threads are quarantined on the dead list this long before
/// their tid becomes reusable.
pub const THREAD_QUARANTINE_SIZE: usize = 16;

/// Cap on a single shadow range reset. Some programs mmap hundreds of
/// gigabytes but touch a small part; past the cap we prefer a potential
/// false positive over an unbounded walk.
pub const MAX_RESET_SIZE: usize = 1 << 30;

/// Freed memory.
/// As if an 8-byte write by thread 0xff..f at epoch 0xff..f, races with
/// everything.
pub const SHADOW_FREED: u64 = 0xffff_ffff_ffff_fff8;

// The shadow word is tid | epoch | is_write:1 | size_log:2 | addr0:3.
const_assert!(TID_BITS + CLK_BITS + 6 == 64);
const_assert!(TRACE_PART_SIZE & (TRACE_PART_SIZE - 1) == 0);
const_assert!(THREAD_QUARANTINE_SIZE > 0);
