//! The callbacks an instrumentation front-end or interceptor layer
//! invokes. Every entry point tracks re-entrancy: when intercepted
//! runtime code calls back into instrumented code, the nested events
//! are dropped instead of being attributed to the application.

use crate::defs::Tid;
use crate::rtl::ThreadState;
use crate::sync::MutexCreateFlags;

#[inline]
fn with_rtl<F: FnOnce(&mut ThreadState)>(thr: &mut ThreadState, f: F) {
    thr.in_rtl += 1;
    if thr.in_rtl == 1 {
        f(thr);
    }
    thr.in_rtl -= 1;
}

macro_rules! sized_accessors {
    ($read_name:ident, $write_name:ident, $size_log:expr) => {
        pub fn $read_name(thr: &mut ThreadState, pc: u64, addr: usize) {
            with_rtl(thr, |t| t.memory_access(pc, addr, $size_log, false));
        }

        pub fn $write_name(thr: &mut ThreadState, pc: u64, addr: usize) {
            with_rtl(thr, |t| t.memory_access(pc, addr, $size_log, true));
        }
    };
}

sized_accessors!(memory_read_1, memory_write_1, 0);
sized_accessors!(memory_read_2, memory_write_2, 1);
sized_accessors!(memory_read_4, memory_write_4, 2);
sized_accessors!(memory_read_8, memory_write_8, 3);

pub fn memory_read_range(thr: &mut ThreadState, pc: u64, addr: usize, size: usize) {
    with_rtl(thr, |t| t.memory_access_range(pc, addr, size, false));
}

pub fn memory_write_range(thr: &mut ThreadState, pc: u64, addr: usize, size: usize) {
    with_rtl(thr, |t| t.memory_access_range(pc, addr, size, true));
}

pub fn memory_range_freed(thr: &mut ThreadState, pc: u64, addr: usize, size: usize) {
    with_rtl(thr, |t| t.memory_range_freed(pc, addr, size));
}

pub fn func_enter(thr: &mut ThreadState, pc: u64) {
    with_rtl(thr, |t| t.func_enter(pc));
}

pub fn func_exit(thr: &mut ThreadState) {
    with_rtl(thr, |t| t.func_exit());
}

pub fn ignore_reads_begin(thr: &mut ThreadState) {
    with_rtl(thr, |t| t.ignore_reads_begin());
}

pub fn ignore_reads_end(thr: &mut ThreadState) {
    with_rtl(thr, |t| t.ignore_reads_end());
}

pub fn ignore_writes_begin(thr: &mut ThreadState) {
    with_rtl(thr, |t| t.ignore_writes_begin());
}

pub fn ignore_writes_end(thr: &mut ThreadState) {
    with_rtl(thr, |t| t.ignore_writes_end());
}

pub fn acquire(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.acquire(pc, addr));
}

pub fn release(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.release(pc, addr));
}

pub fn release_store(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.release_store(pc, addr));
}

pub fn mutex_create(thr: &mut ThreadState, pc: u64, addr: usize, flags: MutexCreateFlags) {
    with_rtl(thr, |t| t.mutex_create(pc, addr, flags));
}

pub fn mutex_destroy(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_destroy(pc, addr));
}

pub fn mutex_lock(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_lock(pc, addr));
}

pub fn mutex_unlock(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_unlock(pc, addr));
}

pub fn mutex_read_lock(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_read_lock(pc, addr));
}

pub fn mutex_read_unlock(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_read_unlock(pc, addr));
}

pub fn mutex_read_or_write_unlock(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.mutex_read_or_write_unlock(pc, addr));
}

pub fn cond_signal(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.cond_signal(pc, addr));
}

pub fn cond_broadcast(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.cond_broadcast(pc, addr));
}

pub fn cond_wait_begin(thr: &mut ThreadState, pc: u64, cond_addr: usize, mutex_addr: usize) {
    with_rtl(thr, |t| t.cond_wait_begin(pc, cond_addr, mutex_addr));
}

pub fn cond_wait_end(thr: &mut ThreadState, pc: u64, cond_addr: usize, mutex_addr: usize) {
    with_rtl(thr, |t| t.cond_wait_end(pc, cond_addr, mutex_addr));
}

pub fn cond_destroy(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.cond_destroy(pc, addr));
}

pub fn semaphore_post(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.semaphore_post(pc, addr));
}

pub fn semaphore_wait_end(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.semaphore_wait_end(pc, addr));
}

pub fn once_complete(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.once_complete(pc, addr));
}

pub fn once_acquire(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.once_acquire(pc, addr));
}

pub fn barrier_wait_before(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.barrier_wait_before(pc, addr));
}

pub fn barrier_wait_after(thr: &mut ThreadState, pc: u64, addr: usize) {
    with_rtl(thr, |t| t.barrier_wait_after(pc, addr));
}

pub fn thread_create(thr: &mut ThreadState, pc: u64, user_handle: usize, detached: bool) -> Tid {
    // Slot allocation must happen even when called re-entrantly; the
    // child is real either way.
    thr.thread_create(pc, user_handle, detached)
}

pub fn thread_finish(thr: &mut ThreadState) {
    thr.thread_finish();
}

pub fn thread_join(thr: &mut ThreadState, pc: u64, user_handle: usize) {
    thr.thread_join(pc, user_handle);
}

pub fn thread_detach(thr: &mut ThreadState, pc: u64, user_handle: usize) {
    thr.thread_detach(pc, user_handle);
}

/// Per-basic-block batching hook.
pub fn trace_switch(thr: &ThreadState) {
    thr.trace_switch();
}
