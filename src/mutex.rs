use crate::log::LogLevel::LogDebug;
use crate::report::{self, ReportType};
use crate::rtl::{HeldMutex, ThreadState};
use crate::sync::MutexCreateFlags;
use crate::trace::EventType::*;

/// Synchronization operations. Every one bumps the caller's epoch,
/// records a trace event, and ends by publishing the epoch as the
/// thread's `fast_synch_epoch`.
impl ThreadState {
    pub fn mutex_create(&mut self, pc: u64, addr: usize, flags: MutexCreateFlags) {
        self.sync_event(EventTypeLock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            if m.explicitly_created {
                report::report_misuse(
                    &ctx,
                    self,
                    addr,
                    ReportType::ReportTypeDoubleInit,
                    "mutex initialized twice",
                );
            }
            m.explicitly_created = true;
            m.flags = flags;
            m.creation_tid = self.tid;
            m.creation_stack = self.shadow_stack.clone();
        }
        self.fast_synch_epoch = self.fast.epoch();
    }

    /// Destroying a held mutex, or one the engine never saw, is API
    /// misuse by the instrumented program; the engine keeps going.
    pub fn mutex_destroy(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeUnlock, pc);
        let ctx = self.ctx.clone();
        match ctx.synctab.get_and_remove(addr) {
            Some(s) => {
                let locked = {
                    let m = s.lock().unwrap();
                    m.owner_tid.is_some()
                };
                if locked {
                    report::report_misuse(
                        &ctx,
                        self,
                        addr,
                        ReportType::ReportTypeDestroyLocked,
                        "mutex destroyed while locked",
                    );
                }
            }
            None => {
                log!(LogDebug, "destroy of unknown mutex {:#x}", addr);
            }
        }
        self.fast_synch_epoch = self.fast.epoch();
    }

    pub fn mutex_lock(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeLock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            if m.owner_tid == Some(self.tid) && m.is_recursive() {
                m.recursion += 1;
            } else {
                // A write lock observes both writer and reader
                // releases.
                self.clock.join(&m.clock);
                self.clock.join(&m.read_clock);
                m.owner_tid = Some(self.tid);
                m.recursion = 1;
            }
        }
        self.mset.push(HeldMutex { addr, write: true });
        self.fast_synch_epoch = self.fast.epoch();
    }

    pub fn mutex_unlock(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeUnlock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            if m.owner_tid != Some(self.tid) {
                report::report_misuse(
                    &ctx,
                    self,
                    addr,
                    ReportType::ReportTypeUnlockOfUnlocked,
                    "unlock of an unlocked mutex",
                );
            } else {
                m.recursion -= 1;
                if m.recursion == 0 {
                    m.owner_tid = None;
                    m.clock.copy_from(&self.clock);
                }
            }
        }
        self.unset_held(addr);
        self.fast_synch_epoch = self.fast.epoch();
    }

    pub fn mutex_read_lock(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeRLock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let m = s.lock().unwrap();
            // Readers run concurrently with readers; only writer
            // releases are observed.
            self.clock.join(&m.clock);
        }
        self.mset.push(HeldMutex { addr, write: false });
        self.fast_synch_epoch = self.fast.epoch();
    }

    pub fn mutex_read_unlock(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeRUnlock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            m.read_clock.join(&self.clock);
        }
        self.unset_held(addr);
        self.fast_synch_epoch = self.fast.epoch();
    }

    /// Unlock entry point for rwlocks whose unlock primitive doesn't
    /// say which kind of lock is being released.
    pub fn mutex_read_or_write_unlock(&mut self, pc: u64, addr: usize) {
        let write = {
            let s = self
                .ctx
                .synctab
                .get_or_create(addr, self.tid, &self.shadow_stack);
            let owner = s.lock().unwrap().owner_tid;
            owner == Some(self.tid)
        };
        if write {
            self.mutex_unlock(pc, addr);
        } else {
            self.mutex_read_unlock(pc, addr);
        }
    }

    // ---------------- generic one-way edges ----------------

    /// Observe everything released at `addr` (fds, semaphores, once
    /// initialization, atomics...).
    pub fn acquire(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeLock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let m = s.lock().unwrap();
            self.clock.join(&m.clock);
        }
        self.fast_synch_epoch = self.fast.epoch();
    }

    /// Publish this thread's history at `addr` for later acquirers,
    /// merging with previous releases.
    pub fn release(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeUnlock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            m.clock.join(&self.clock);
        }
        self.fast_synch_epoch = self.fast.epoch();
    }

    /// Destructive release, for initializers that must not inherit
    /// earlier history at the address.
    pub fn release_store(&mut self, pc: u64, addr: usize) {
        self.sync_event(EventTypeUnlock, pc);
        let ctx = self.ctx.clone();
        let s = ctx.synctab.get_or_create(addr, self.tid, &self.shadow_stack);
        {
            let mut m = s.lock().unwrap();
            m.clock.copy_from(&self.clock);
        }
        self.fast_synch_epoch = self.fast.epoch();
    }

    // ---------------- condition variables ----------------

    // A wait is unlock + native wait + relock; the mutex edge carries
    // the ordering, waking does not need its own edge. The signal-side
    // release is still recorded so programs that pair a naked signal
    // with a data handoff on the condvar address stay clean.

    pub fn cond_signal(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    pub fn cond_broadcast(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    /// Called before the native wait: gives up the mutex.
    pub fn cond_wait_begin(&mut self, pc: u64, _cond_addr: usize, mutex_addr: usize) {
        self.mutex_unlock(pc, mutex_addr);
    }

    /// Called after the native wait returns: observes the signaler and
    /// retakes the mutex.
    pub fn cond_wait_end(&mut self, pc: u64, cond_addr: usize, mutex_addr: usize) {
        self.acquire(pc, cond_addr);
        self.mutex_lock(pc, mutex_addr);
    }

    pub fn cond_destroy(&mut self, _pc: u64, addr: usize) {
        self.ctx.synctab.get_and_remove(addr);
    }

    // ---------------- semaphores ----------------

    pub fn semaphore_post(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    /// Called after a successful wait; a failed or timed-out wait
    /// observed nothing.
    pub fn semaphore_wait_end(&mut self, pc: u64, addr: usize) {
        self.acquire(pc, addr);
    }

    // ---------------- once initialization ----------------

    /// The thread that ran the initializer publishes it. Destructive:
    /// whatever history the address carried before initialization is
    /// not part of the handoff.
    pub fn once_complete(&mut self, pc: u64, addr: usize) {
        self.release_store(pc, addr);
    }

    /// Every other thread passing the once gate observes the
    /// initializer.
    pub fn once_acquire(&mut self, pc: u64, addr: usize) {
        self.acquire(pc, addr);
    }

    // ---------------- barriers ----------------

    /// Arrival half of a barrier wait: release into the barrier's
    /// shared clock.
    pub fn barrier_wait_before(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    /// Departure half: acquire the merged clock of every arrived
    /// thread.
    pub fn barrier_wait_after(&mut self, pc: u64, addr: usize) {
        self.acquire(pc, addr);
    }

    fn unset_held(&mut self, addr: usize) {
        if let Some(idx) = self.mset.iter().rposition(|h| h.addr == addr) {
            self.mset.remove(idx);
        }
    }
}
