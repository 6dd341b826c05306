use crate::clock::VectorClock;
use crate::defs::Tid;
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

bitflags! {
    /// How a mutex was declared at creation.
    pub struct MutexCreateFlags: u32 {
        const MUTEX_RWLOCK = 1 << 0;
        const MUTEX_RECURSIVE = 1 << 1;
    }
}

/// The engine's mirror of one application synchronization object,
/// keyed by its address. `clock` carries write-release edges,
/// `read_clock` accumulates read-unlock releases of an rwlock.
pub struct SyncVar {
    pub addr: usize,
    pub creation_tid: Tid,
    pub creation_stack: Vec<u64>,
    pub flags: MutexCreateFlags,
    /// False for objects first seen at a lock op (uninitialized-but-used
    /// mutexes are permitted by the platform's default).
    pub explicitly_created: bool,
    pub owner_tid: Option<Tid>,
    pub recursion: u32,
    pub clock: VectorClock,
    pub read_clock: VectorClock,
}

impl SyncVar {
    fn new(addr: usize, creation_tid: Tid, creation_stack: Vec<u64>) -> SyncVar {
        SyncVar {
            addr,
            creation_tid,
            creation_stack,
            flags: MutexCreateFlags::empty(),
            explicitly_created: false,
            owner_tid: None,
            recursion: 0,
            clock: VectorClock::new(),
            read_clock: VectorClock::new(),
        }
    }

    pub fn is_recursive(&self) -> bool {
        self.flags.contains(MutexCreateFlags::MUTEX_RECURSIVE)
    }

    pub fn is_rwlock(&self) -> bool {
        self.flags.contains(MutexCreateFlags::MUTEX_RWLOCK)
    }
}

pub type SyncVarRef = Arc<Mutex<SyncVar>>;

const SYNC_TAB_PARTS: usize = 16;

/// Address-keyed table of sync variables, partitioned to keep bucket
/// lock contention off unrelated sync objects. A variable's own mutex
/// is strictly finer than any bucket lock: bucket locks are released
/// before the returned variable is locked by the caller.
pub struct SyncTab {
    parts: Vec<Mutex<HashMap<usize, SyncVarRef>>>,
}

impl SyncTab {
    pub fn new() -> SyncTab {
        SyncTab {
            parts: (0..SYNC_TAB_PARTS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn part(&self, addr: usize) -> &Mutex<HashMap<usize, SyncVarRef>> {
        &self.parts[addr.wrapping_mul(0x9e37_79b9_7f4a_7c15) % SYNC_TAB_PARTS]
    }

    /// Looks up the variable at `addr`, creating it on a miss. A lock
    /// op on an address that was never `mutex_create`d lands here and
    /// transitions it Absent -> Live.
    pub fn get_or_create(
        &self,
        addr: usize,
        creation_tid: Tid,
        creation_stack: &[u64],
    ) -> SyncVarRef {
        let mut part = self.part(addr).lock().unwrap();
        part.entry(addr)
            .or_insert_with(|| {
                Arc::new(Mutex::new(SyncVar::new(
                    addr,
                    creation_tid,
                    creation_stack.to_vec(),
                )))
            })
            .clone()
    }

    pub fn get(&self, addr: usize) -> Option<SyncVarRef> {
        self.part(addr).lock().unwrap().get(&addr).cloned()
    }

    /// Detaches the variable at `addr` from the table; the caller holds
    /// the last engine reference.
    pub fn get_and_remove(&self, addr: usize) -> Option<SyncVarRef> {
        self.part(addr).lock().unwrap().remove(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn create_then_get_returns_same_variable() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x1000, 1, &[]);
        let b = tab.get_or_create(0x1000, 2, &[]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().unwrap().creation_tid, 1);
    }

    #[test]
    fn remove_detaches() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x1000, 1, &[]);
        let removed = tab.get_and_remove(0x1000).unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert!(tab.get(0x1000).is_none());
        assert!(tab.get_and_remove(0x1000).is_none());
        let c = tab.get_or_create(0x1000, 3, &[]);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    // Random get-or-add / remove churn against a golden map.
    #[test]
    fn table_stress() {
        const ITERS: usize = 64 * 1024;
        const RANGE: usize = 1000;

        let tab = SyncTab::new();
        let mut golden: Vec<Option<SyncVarRef>> = vec![None; RANGE];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..ITERS {
            let addr = rng.gen_range(1, RANGE);
            if rng.gen::<bool>() {
                let v = tab.get_or_create(addr, 0, &[]);
                assert_eq!(v.lock().unwrap().addr, addr);
                if let Some(prev) = &golden[addr] {
                    assert!(Arc::ptr_eq(prev, &v));
                }
                golden[addr] = Some(v);
            } else {
                let v = tab.get_and_remove(addr);
                match (&golden[addr], &v) {
                    (Some(g), Some(r)) => assert!(Arc::ptr_eq(g, r)),
                    (None, None) => {}
                    _ => panic!("table and golden map disagree at {:#x}", addr),
                }
                golden[addr] = None;
            }
        }
        for (addr, g) in golden.iter().enumerate() {
            if let Some(g) = g {
                let v = tab.get_and_remove(addr).unwrap();
                assert!(Arc::ptr_eq(g, &v));
            } else if addr != 0 {
                assert!(tab.get(addr).is_none());
            }
        }
    }
}
