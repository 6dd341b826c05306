use crate::clock::VectorClock;
use crate::defs::{Epoch, Tid, MAX_TID, THREAD_QUARANTINE_SIZE};
use crate::log::LogLevel::LogDebug;
use crate::trace::Trace;
use std::collections::VecDeque;
use std::sync::Arc;

/// Thread lifecycle. Invalid -> Created -> Running -> Finished -> Dead;
/// a Dead slot may be revived to Created with a bumped `reuse_count`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
    ThreadStatusInvalid,
    ThreadStatusCreated,
    ThreadStatusRunning,
    ThreadStatusFinished,
    ThreadStatusDead,
}

use ThreadStatus::*;

/// Everything the engine remembers about one thread slot. Owned by the
/// registry; the running thread itself carries only its `ThreadState`.
pub struct ThreadContext {
    pub tid: Tid,
    pub reuse_count: u32,
    pub status: ThreadStatus,
    pub detached: bool,
    /// Opaque handle the front-end joins/detaches by (a pthread_t on
    /// POSIX platforms).
    pub user_handle: usize,
    pub creator_tid: Option<Tid>,
    /// Creator's epoch at the create call.
    pub parent_epoch: Epoch,
    pub creation_stack: Vec<u64>,
    /// First epoch of the current life of this slot.
    pub epoch0: Epoch,
    /// Creator's clock at create; the child acquires it at start.
    pub startup_clock: VectorClock,
    /// The thread's clock at finish; a joiner acquires it.
    pub final_clock: Option<VectorClock>,
    pub final_epoch: Epoch,
    /// Retained after death so late joins can still reconstruct stacks;
    /// dropped when the slot leaves the dead-list quarantine.
    pub trace: Option<Arc<Trace>>,
}

impl ThreadContext {
    fn new(tid: Tid) -> ThreadContext {
        ThreadContext {
            tid,
            reuse_count: 0,
            status: ThreadStatusInvalid,
            detached: false,
            user_handle: 0,
            creator_tid: None,
            parent_epoch: 0,
            creation_stack: Vec::new(),
            epoch0: 0,
            startup_clock: VectorClock::new(),
            final_clock: None,
            final_epoch: 0,
            trace: None,
        }
    }
}

/// The thread table. All mutation happens under the context's registry
/// mutex; `thread_join` waits on the paired condvar.
pub struct ThreadRegistry {
    contexts: Vec<ThreadContext>,
    dead_list: VecDeque<Tid>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry {
            contexts: Vec::new(),
            dead_list: VecDeque::new(),
        }
    }

    pub fn get(&self, tid: Tid) -> Option<&ThreadContext> {
        self.contexts.get(tid as usize)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadContext> {
        self.contexts.get_mut(tid as usize)
    }

    /// Allocates a slot for a new thread: revives the oldest quarantined
    /// dead slot if the quarantine is full, otherwise grows the table.
    pub fn create(
        &mut self,
        creator_tid: Option<Tid>,
        parent_epoch: Epoch,
        startup_clock: VectorClock,
        creation_stack: Vec<u64>,
        user_handle: usize,
        detached: bool,
    ) -> Tid {
        let tid = if self.dead_list.len() > THREAD_QUARANTINE_SIZE {
            let tid = self.dead_list.pop_front().unwrap();
            let reuse = self.contexts[tid as usize].reuse_count + 1;
            log!(LogDebug, "reusing thread slot {} (reuse {})", tid, reuse);
            self.contexts[tid as usize] = ThreadContext::new(tid);
            self.contexts[tid as usize].reuse_count = reuse;
            tid
        } else {
            if self.contexts.len() as u64 >= MAX_TID as u64 {
                fatal!("thread table full: {} threads", self.contexts.len());
            }
            let tid = self.contexts.len() as Tid;
            self.contexts.push(ThreadContext::new(tid));
            tid
        };
        let tctx = &mut self.contexts[tid as usize];
        tctx.status = ThreadStatusCreated;
        tctx.creator_tid = creator_tid;
        tctx.parent_epoch = parent_epoch;
        tctx.startup_clock = startup_clock;
        tctx.creation_stack = creation_stack;
        tctx.user_handle = user_handle;
        tctx.detached = detached;
        tid
    }

    /// Finds the most recent non-dead thread the front-end knows by
    /// `user_handle`.
    pub fn find_by_handle(&self, user_handle: usize) -> Option<Tid> {
        self.contexts
            .iter()
            .rev()
            .find(|t| {
                t.user_handle == user_handle
                    && match t.status {
                        ThreadStatusCreated | ThreadStatusRunning | ThreadStatusFinished => true,
                        _ => false,
                    }
            })
            .map(|t| t.tid)
    }

    /// Moves a finished (or detached-finished) thread to the dead list.
    pub fn push_dead(&mut self, tid: Tid) {
        let tctx = &mut self.contexts[tid as usize];
        debug_assert_eq!(tctx.status, ThreadStatusDead);
        self.dead_list.push_back(tid);
        // The quarantine only retains traces for its newest members;
        // an old enough dead thread loses stack reconstruction.
        if self.dead_list.len() > THREAD_QUARANTINE_SIZE {
            let oldest = self.dead_list[0];
            self.contexts[oldest as usize].trace = None;
        }
    }

    pub fn alive_count(&self) -> usize {
        self.contexts
            .iter()
            .filter(|t| match t.status {
                ThreadStatusCreated | ThreadStatusRunning => true,
                _ => false,
            })
            .count()
    }
}
