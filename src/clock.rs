use crate::defs::{Epoch, Tid};

/// A vector clock: for each thread, the most recent epoch of that
/// thread this clock has observed. Dense storage indexed by tid; a
/// missing entry means "never observed" and reads as zero.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VectorClock {
    clk: Vec<Epoch>,
}

impl VectorClock {
    pub fn new() -> VectorClock {
        VectorClock { clk: Vec::new() }
    }

    pub fn get(&self, tid: Tid) -> Epoch {
        self.clk.get(tid as usize).copied().unwrap_or(0)
    }

    /// Stores `max(current, epoch)`; a clock never goes backwards.
    pub fn set(&mut self, tid: Tid, epoch: Epoch) {
        let idx = tid as usize;
        if idx >= self.clk.len() {
            self.clk.resize(idx + 1, 0);
        }
        if self.clk[idx] < epoch {
            self.clk[idx] = epoch;
        }
    }

    /// Pointwise max.
    pub fn join(&mut self, other: &VectorClock) {
        if other.clk.len() > self.clk.len() {
            self.clk.resize(other.clk.len(), 0);
        }
        for (mine, theirs) in self.clk.iter_mut().zip(other.clk.iter()) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
    }

    pub fn copy_from(&mut self, other: &VectorClock) {
        self.clk.clear();
        self.clk.extend_from_slice(&other.clk);
    }

    /// `acquire` is `join`: afterwards this clock has observed
    /// everything `from` had observed.
    pub fn acquire(&mut self, from: &VectorClock) {
        self.join(from);
    }

    /// `release` merges this clock into `into`.
    pub fn release(&self, into: &mut VectorClock) {
        into.join(self);
    }

    /// Release into `mid`, then acquire back from it.
    pub fn release_acquire(&mut self, mid: &mut VectorClock) {
        mid.join(self);
        self.join(mid);
    }
}
