use crate::annotations::AnnotationTables;
use crate::clock::VectorClock;
use crate::defs::{Epoch, Tid, MAX_EPOCH, SHADOW_CNT, SHADOW_FREED, TRACE_PART_SIZE};
use crate::flags::Flags;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::report::{self, NoSuppressions, NoSymbolizer, Report, ReportBuilder, ReportType,
                    SuppressionEngine, Symbolizer};
use crate::shadow::{FastState, Shadow};
use crate::shadow_mem::ShadowMemory;
use crate::stat::{StatType, Stats};
use crate::sync::SyncTab;
use crate::thread::ThreadStatus::*;
use crate::thread::ThreadRegistry;
use crate::trace::{EventType, Trace};
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};

/// Everything shared by all instrumented threads. One per detected
/// process; every `ThreadState` holds a reference.
pub struct Context {
    pub flags: Flags,
    pub shadow: ShadowMemory,
    pub(crate) synctab: SyncTab,
    pub(crate) registry: Mutex<ThreadRegistry>,
    pub(crate) registry_cv: Condvar,
    pub(crate) report: ReportBuilder,
    pub(crate) annotations: AnnotationTables,
    pub(crate) stat: Mutex<Stats>,
}

impl Context {
    pub fn new(flags: Flags) -> Arc<Context> {
        Context::with_collaborators(
            flags,
            Box::new(io::stderr()),
            Box::new(NoSymbolizer),
            Box::new(NoSuppressions),
        )
    }

    /// Construction with explicit collaborators: the report sink, the
    /// symbolizer and the suppression engine all live outside the core.
    pub fn with_collaborators(
        flags: Flags,
        sink: Box<dyn Write + Send>,
        symbolizer: Box<dyn Symbolizer>,
        suppressions: Box<dyn SuppressionEngine>,
    ) -> Arc<Context> {
        crate::log::apply_verbosity(flags.verbosity);
        let annotations = AnnotationTables::new(flags.ignore_regions.as_deref());
        Arc::new(Context {
            flags,
            shadow: ShadowMemory::new(),
            synctab: SyncTab::new(),
            registry: Mutex::new(ThreadRegistry::new()),
            registry_cv: Condvar::new(),
            report: ReportBuilder::new(sink, symbolizer, suppressions),
            annotations,
            stat: Mutex::new(Stats::new()),
        })
    }

    /// Creates and starts thread 0. Must be the first thread operation
    /// on this context.
    pub fn main_thread(self: &Arc<Context>) -> ThreadState {
        let tid = {
            let mut reg = self.registry.lock().unwrap();
            reg.create(None, 0, VectorClock::new(), Vec::new(), 0, false)
        };
        if tid != 0 {
            fatal!("main thread created after other threads (got tid {})", tid);
        }
        self.thread_start(tid)
    }

    /// Binds the calling execution to a slot allocated by
    /// `thread_create`, acquiring the happens-before edge from the
    /// creator. Returns the new thread's state; the caller moves it
    /// into the thread it belongs to.
    pub fn thread_start(self: &Arc<Context>, tid: Tid) -> ThreadState {
        let parts = self.flags.trace_parts();
        let mut reg = self.registry.lock().unwrap();
        let tctx = match reg.get_mut(tid) {
            Some(t) => t,
            None => fatal!("thread_start of unknown tid {}", tid),
        };
        if tctx.status != ThreadStatusCreated {
            fatal!(
                "thread_start: thread {} is {:?}, expected Created",
                tid,
                tctx.status
            );
        }
        tctx.status = ThreadStatusRunning;
        tctx.epoch0 = 1;
        let trace = Arc::new(Trace::new(parts));
        tctx.trace = Some(trace.clone());
        let mut thr = ThreadState {
            ctx: self.clone(),
            tid,
            reuse_count: tctx.reuse_count,
            fast: FastState::new(tid, 0),
            clock: VectorClock::new(),
            fast_synch_epoch: 0,
            ignore_reads: 0,
            ignore_writes: 0,
            in_rtl: 0,
            shadow_stack: Vec::new(),
            trace,
            mset: Vec::new(),
            stat: Stats::new(),
        };
        thr.clock.join(&tctx.startup_clock);
        log!(LogDebug, "thread {} started (reuse {})", tid, thr.reuse_count);
        thr
    }

    /// Reconstructs the stack of `tid` at `epoch` from its trace.
    /// Empty when the thread or the epoch is out of the live window.
    pub fn restore_stack(&self, tid: Tid, epoch: Epoch) -> Vec<u64> {
        let trace = {
            let reg = self.registry.lock().unwrap();
            match reg.get(tid) {
                Some(t) => match t.status {
                    ThreadStatusRunning | ThreadStatusFinished | ThreadStatusDead => {
                        t.trace.clone()
                    }
                    _ => None,
                },
                None => None,
            }
        };
        match trace {
            Some(t) => t.restore_stack(epoch),
            None => Vec::new(),
        }
    }

    /// Zeroes the shadow of `[addr, addr + size)`; freshly mapped or
    /// recycled application memory starts with no history.
    pub fn memory_reset_range(&self, addr: usize, size: usize) {
        let base = addr & !7;
        self.shadow.range_set(base, size + (addr - base), 0);
    }

    pub fn reported_races(&self) -> usize {
        self.report.reported_races()
    }

    pub fn warnings(&self) -> usize {
        self.report.warnings()
    }

    /// Structured reports retained for collaborator consumption,
    /// bounded by `max_reported_races`.
    pub fn reports(&self) -> Vec<Report> {
        self.report.reports()
    }

    /// End-of-process accounting: surfaces expected races that never
    /// fired and returns the process exit status.
    pub fn finalize(&self) -> i32 {
        for (addr, desc) in self.annotations.unmet_expectations() {
            self.report.special_report(
                ReportType::ReportTypeExpectedRaceNotFound,
                addr,
                &format!("expected race at {:#x} did not fire: {}", addr, desc),
            );
        }
        if self.flags.verbosity >= 2 {
            self.stat.lock().unwrap().print();
        }
        let races = self.report.reported_races();
        self.report.write_summary(races);
        if races > 0 {
            self.flags.exit_status_on_race
        } else {
            0
        }
    }
}

/// A mutex currently held by a thread, for report context.
#[derive(Copy, Clone, Debug)]
pub(crate) struct HeldMutex {
    pub addr: usize,
    pub write: bool,
}

/// Per-thread detector state. Exactly one per running OS thread; the
/// front-end keeps it in a platform thread-local and passes it to every
/// entry point.
pub struct ThreadState {
    pub(crate) ctx: Arc<Context>,
    pub tid: Tid,
    pub(crate) reuse_count: u32,
    pub(crate) fast: FastState,
    pub(crate) clock: VectorClock,
    /// This thread's epoch at its most recent synchronization event.
    /// Lets the hot path prove same-thread shadow words redundant
    /// without consulting the vector clock.
    pub(crate) fast_synch_epoch: Epoch,
    /// Ignore-region nesting depths. An end without a begin drives the
    /// counter negative; any imbalance is reported when the thread
    /// finishes.
    pub(crate) ignore_reads: i32,
    pub(crate) ignore_writes: i32,
    /// Re-entrancy depth; entry points become no-ops when the engine
    /// calls back into itself through intercepted runtime code.
    pub(crate) in_rtl: u32,
    pub(crate) shadow_stack: Vec<u64>,
    pub(crate) trace: Arc<Trace>,
    pub(crate) mset: Vec<HeldMutex>,
    pub(crate) stat: Stats,
}

impl ThreadState {
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn epoch(&self) -> Epoch {
        self.fast.epoch()
    }

    fn part_switch(&self, epoch: Epoch) {
        if epoch > MAX_EPOCH - 2 * TRACE_PART_SIZE as u64 {
            fatal!("epoch overflow in thread {}", self.tid);
        }
        self.trace.switch_part(epoch, &self.shadow_stack);
    }

    /// Per-basic-block batching hook: re-stamps the current trace part
    /// header so stack reconstruction stays exact across batched epoch
    /// advances.
    pub fn trace_switch(&self) {
        let epoch = self.fast.epoch();
        let base = epoch & !(TRACE_PART_SIZE as u64 - 1);
        if base != 0 {
            self.part_switch(base);
        }
    }

    /// Bumps the epoch and records a trace event; common prologue of
    /// every synchronization operation.
    pub(crate) fn sync_event(&mut self, typ: EventType, pc: u64) {
        self.fast.increment_epoch();
        let epoch = self.fast.epoch();
        if epoch % TRACE_PART_SIZE as u64 == 0 {
            self.part_switch(epoch);
        }
        self.trace.add_event(epoch, typ, pc);
        self.clock.set(self.tid, epoch);
    }

    // ------------------------- memory accesses -------------------------

    /// The per-access engine: record the access in the shadow cell of
    /// `addr` and check it against the cell's recorded history.
    /// `size_log` of 0,1,2,3 means an access of 1,2,4,8 bytes.
    pub fn memory_access(&mut self, pc: u64, addr: usize, size_log: u64, is_write: bool) {
        debug_assert!(size_log <= 3);
        debug_assert!((addr & 7) + (1 << size_log) as usize <= 8);
        if (is_write && self.ignore_writes > 0) || (!is_write && self.ignore_reads > 0) {
            return;
        }
        self.stat.inc(StatType::StatMop);
        self.stat.inc(if is_write {
            StatType::StatMopWrite
        } else {
            StatType::StatMopRead
        });
        self.stat.inc(StatType::mop_of_size_log(size_log));

        self.fast.increment_epoch();
        let epoch = self.fast.epoch();
        if epoch % TRACE_PART_SIZE as u64 == 0 {
            self.part_switch(epoch);
        }
        self.trace.add_event(epoch, EventType::EventTypeMop, pc);

        let mut cur = Shadow::new(self.fast);
        cur.set_addr0_and_size_log((addr & 7) as u64, size_log);
        cur.set_write(is_write);

        let cell = self.ctx.shadow.cell(addr);
        let mut store_pending = Some(cur);
        let off = cur.search_offset();

        // Scan all shadow values and dispatch to four categories: same,
        // replace, candidate and race. Access sizes are only ever
        // equal, intersecting or disjoint.
        for i in 0..SHADOW_CNT {
            self.stat.inc(StatType::StatShadowProcessed);
            let sp = &cell[(i + off) % SHADOW_CNT];
            let old = Shadow::from_raw(sp.load(Ordering::Relaxed));
            if old.is_zero() {
                self.stat.inc(StatType::StatShadowZero);
                if let Some(s) = store_pending.take() {
                    sp.store(s.raw(), Ordering::Relaxed);
                }
                continue;
            }
            if Shadow::addr0_and_size_equal(cur, old) {
                self.stat.inc(StatType::StatShadowSameSize);
                if Shadow::tids_equal(cur, old) {
                    self.stat.inc(StatType::StatShadowSameThread);
                    if old.epoch() >= self.fast_synch_epoch {
                        if old.is_write() || !is_write {
                            // The cell already holds effectively the
                            // same info (same tid, same sync window,
                            // same range); nothing to record.
                            self.stat.inc(StatType::StatMopSame);
                            return;
                        }
                        // A read upgraded to a write past the last
                        // synchronization point.
                        if let Some(s) = store_pending.take() {
                            sp.store(s.raw(), Ordering::Relaxed);
                        }
                    } else if !old.is_write() && is_write {
                        if let Some(s) = store_pending.take() {
                            sp.store(s.raw(), Ordering::Relaxed);
                        }
                    }
                    continue;
                }
                // Another thread: racy unless ordered by a sync edge.
                self.stat.inc(StatType::StatShadowAnotherThread);
                if self.clock.get(old.tid()) >= old.epoch() {
                    if let Some(s) = store_pending.take() {
                        sp.store(s.raw(), Ordering::Relaxed);
                    }
                    continue;
                }
                if !old.is_write() && !is_write {
                    continue;
                }
                self.report_race(addr, cur, old);
                return;
            }
            if Shadow::two_ranges_intersect(cur, old) {
                self.stat.inc(StatType::StatShadowIntersect);
                if Shadow::tids_equal(cur, old) {
                    self.stat.inc(StatType::StatShadowSameThread);
                    continue;
                }
                self.stat.inc(StatType::StatShadowAnotherThread);
                if self.clock.get(old.tid()) >= old.epoch() {
                    continue;
                }
                if !old.is_write() && !is_write {
                    continue;
                }
                self.report_race(addr, cur, old);
                return;
            }
            // Disjoint ranges: not our business.
            self.stat.inc(StatType::StatShadowNotIntersect);
        }

        if let Some(s) = store_pending {
            // All slots occupied by unrelated history: evict one.
            let victim = (epoch % SHADOW_CNT as u64) as usize;
            cell[victim].store(s.raw(), Ordering::Relaxed);
            self.stat.inc(StatType::StatShadowReplace);
        }
    }

    /// Bulk access: unaligned edges byte by byte, the aligned middle in
    /// 8-byte steps, preserving per-cell scan semantics without a
    /// byte-loop in the common case.
    pub fn memory_access_range(&mut self, pc: u64, addr: usize, size: usize, is_write: bool) {
        let mut addr = addr;
        let mut size = size;
        while addr % 8 != 0 && size > 0 {
            self.memory_access(pc, addr, 0, is_write);
            addr += 1;
            size -= 1;
        }
        while size >= 8 {
            self.stat.inc(StatType::StatMopRange);
            self.memory_access(pc, addr, 3, is_write);
            addr += 8;
            size -= 8;
        }
        while size > 0 {
            self.memory_access(pc, addr, 0, is_write);
            addr += 1;
            size -= 1;
        }
    }

    /// Deallocation: a synthetic write over the range (so live readers
    /// race with the free), then the freed sentinel into every cell.
    pub fn memory_range_freed(&mut self, pc: u64, addr: usize, size: usize) {
        self.memory_access_range(pc, addr, size, true);
        let base = addr & !7;
        self.ctx.shadow.range_set(base, size + (addr - base), SHADOW_FREED);
    }

    fn report_race(&self, addr: usize, cur: Shadow, old: Shadow) {
        report::report_race(&self.ctx, self, addr, cur, old);
    }

    // ----------------------- function boundaries -----------------------

    pub fn func_enter(&mut self, pc: u64) {
        self.stat.inc(StatType::StatFuncEnter);
        self.fast.increment_epoch();
        let epoch = self.fast.epoch();
        if epoch % TRACE_PART_SIZE as u64 == 0 {
            self.part_switch(epoch);
        }
        self.trace.add_event(epoch, EventType::EventTypeFuncEnter, pc);
        self.shadow_stack.push(pc);
    }

    pub fn func_exit(&mut self) {
        self.stat.inc(StatType::StatFuncExit);
        self.fast.increment_epoch();
        let epoch = self.fast.epoch();
        if epoch % TRACE_PART_SIZE as u64 == 0 {
            self.part_switch(epoch);
        }
        self.trace.add_event(epoch, EventType::EventTypeFuncExit, 0);
        if self.shadow_stack.pop().is_none() {
            // Uninstrumented caller unwinding through instrumented code.
            log!(
                LogDebug,
                "func_exit without matching func_enter in thread {}",
                self.tid
            );
        }
    }

    // --------------------------- ignores -------------------------------

    pub fn ignore_reads_begin(&mut self) {
        self.ignore_reads += 1;
    }

    pub fn ignore_reads_end(&mut self) {
        self.ignore_reads -= 1;
    }

    pub fn ignore_writes_begin(&mut self) {
        self.ignore_writes += 1;
    }

    pub fn ignore_writes_end(&mut self) {
        self.ignore_writes -= 1;
    }

    fn report_broken_ignore(&self, desc: &str) {
        let ctx = self.ctx.clone();
        report::report_misuse(&ctx, self, 0, ReportType::ReportTypeBrokenIgnore, desc);
    }

    // ----------------------- thread lifecycle --------------------------

    /// Allocates a slot for a thread about to be spawned and records
    /// the happens-before edge from this (creating) thread to it.
    pub fn thread_create(&mut self, pc: u64, user_handle: usize, detached: bool) -> Tid {
        self.sync_event(EventType::EventTypeMop, pc);
        let epoch = self.fast.epoch();
        let ctx = self.ctx.clone();
        let tid = {
            let mut reg = ctx.registry.lock().unwrap();
            reg.create(
                Some(self.tid),
                epoch,
                self.clock.clone(),
                self.shadow_stack.clone(),
                user_handle,
                detached,
            )
        };
        log!(LogDebug, "thread {} created thread {}", self.tid, tid);
        self.fast_synch_epoch = epoch;
        tid
    }

    /// Tears down this thread's instrumented life. The slot stays
    /// Finished until joined (Dead immediately when detached).
    pub fn thread_finish(&mut self) {
        if self.ignore_reads != 0 {
            self.report_broken_ignore(&format!(
                "thread finished with unbalanced ignore_reads begin/end (depth {})",
                self.ignore_reads
            ));
            self.ignore_reads = 0;
        }
        if self.ignore_writes != 0 {
            self.report_broken_ignore(&format!(
                "thread finished with unbalanced ignore_writes begin/end (depth {})",
                self.ignore_writes
            ));
            self.ignore_writes = 0;
        }
        self.sync_event(EventType::EventTypeMop, 0);
        let epoch = self.fast.epoch();
        let ctx = self.ctx.clone();
        {
            let mut reg = ctx.registry.lock().unwrap();
            let tctx = match reg.get_mut(self.tid) {
                Some(t) => t,
                None => fatal!("thread_finish of unknown tid {}", self.tid),
            };
            if tctx.status != ThreadStatusRunning {
                fatal!(
                    "thread_finish: thread {} is {:?}, expected Running",
                    self.tid,
                    tctx.status
                );
            }
            tctx.final_clock = Some(self.clock.clone());
            tctx.final_epoch = epoch;
            if tctx.detached {
                tctx.status = ThreadStatusDead;
                reg.push_dead(self.tid);
            } else {
                tctx.status = ThreadStatusFinished;
            }
        }
        ctx.registry_cv.notify_all();
        ctx.stat.lock().unwrap().merge(&self.stat);
        log!(LogDebug, "thread {} finished", self.tid);
    }

    /// Waits for the thread known by `user_handle` to finish, acquires
    /// its final clock and reaps it onto the dead list.
    pub fn thread_join(&mut self, pc: u64, user_handle: usize) {
        self.sync_event(EventType::EventTypeMop, pc);
        let ctx = self.ctx.clone();
        let mut reg = ctx.registry.lock().unwrap();
        let tid = match reg.find_by_handle(user_handle) {
            Some(t) => t,
            None => {
                log!(LogWarn, "join of unknown thread handle {:#x}", user_handle);
                return;
            }
        };
        loop {
            match reg.get(tid).unwrap().status {
                ThreadStatusFinished => break,
                ThreadStatusCreated | ThreadStatusRunning => {
                    reg = ctx.registry_cv.wait(reg).unwrap();
                }
                other => {
                    log!(LogWarn, "join of thread {} in state {:?}", tid, other);
                    return;
                }
            }
        }
        let tctx = reg.get_mut(tid).unwrap();
        if tctx.detached {
            log!(LogWarn, "join of detached thread {}", tid);
        }
        if let Some(final_clock) = &tctx.final_clock {
            self.clock.join(final_clock);
        }
        tctx.status = ThreadStatusDead;
        reg.push_dead(tid);
        drop(reg);
        self.fast_synch_epoch = self.fast.epoch();
        log!(LogDebug, "thread {} joined thread {}", self.tid, tid);
    }

    pub fn thread_detach(&mut self, _pc: u64, user_handle: usize) {
        let ctx = self.ctx.clone();
        let mut reg = ctx.registry.lock().unwrap();
        let tid = match reg.find_by_handle(user_handle) {
            Some(t) => t,
            None => {
                log!(LogWarn, "detach of unknown thread handle {:#x}", user_handle);
                return;
            }
        };
        let tctx = reg.get_mut(tid).unwrap();
        if tctx.status == ThreadStatusFinished {
            tctx.status = ThreadStatusDead;
            reg.push_dead(tid);
        } else {
            tctx.detached = true;
        }
    }
}
