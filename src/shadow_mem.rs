use crate::defs::{MAX_RESET_SIZE, SHADOW_CNT};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

// Application memory is shadowed in chunks of 2^CHUNK_SHIFT bytes,
// allocated on first touch and never moved, so a cell reference stays
// valid for the lifetime of the arena.
const CHUNK_SHIFT: usize = 16;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
const CELLS_PER_CHUNK: usize = CHUNK_SIZE / 8;
const WORDS_PER_CHUNK: usize = CELLS_PER_CHUNK * SHADOW_CNT;

// Capacity of the chunk table, i.e. how many distinct 64 KiB regions of
// application memory can be tracked at once.
const CHUNK_TABLE_SIZE: usize = 1 << 13;

struct ShadowChunk {
    // addr >> CHUNK_SHIFT of the region this chunk shadows.
    id: usize,
    words: Box<[AtomicU64]>,
}

impl ShadowChunk {
    fn new(id: usize) -> Box<ShadowChunk> {
        let words: Vec<AtomicU64> = (0..WORDS_PER_CHUNK).map(|_| AtomicU64::new(0)).collect();
        Box::new(ShadowChunk {
            id,
            words: words.into_boxed_slice(),
        })
    }
}

/// The shadow arena: maps every aligned 8-byte application region to a
/// cell of `SHADOW_CNT` shadow words.
///
/// Lookup is a lock-free probe over a fixed table of lazily allocated
/// chunks. Shadow words themselves are read and written with relaxed
/// atomics and no locking; lost updates merely degrade the recorded
/// history, which the access engine tolerates.
pub struct ShadowMemory {
    table: Box<[AtomicPtr<ShadowChunk>]>,
}

unsafe impl Send for ShadowMemory {}
unsafe impl Sync for ShadowMemory {}

impl ShadowMemory {
    pub fn new() -> ShadowMemory {
        let table: Vec<AtomicPtr<ShadowChunk>> = (0..CHUNK_TABLE_SIZE)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        ShadowMemory {
            table: table.into_boxed_slice(),
        }
    }

    fn chunk(&self, addr: usize, create: bool) -> Option<&ShadowChunk> {
        let id = addr >> CHUNK_SHIFT;
        // Fibonacci hashing spreads consecutive chunk ids.
        let mut slot = id.wrapping_mul(0x9e37_79b9_7f4a_7c15) % CHUNK_TABLE_SIZE;
        for _ in 0..CHUNK_TABLE_SIZE {
            let p = self.table[slot].load(Ordering::Acquire);
            if p.is_null() {
                if !create {
                    return None;
                }
                let fresh = Box::into_raw(ShadowChunk::new(id));
                match self.table[slot].compare_exchange(
                    std::ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(unsafe { &*fresh }),
                    Err(winner) => {
                        // Somebody raced us into this slot.
                        drop(unsafe { Box::from_raw(fresh) });
                        let w = unsafe { &*winner };
                        if w.id == id {
                            return Some(w);
                        }
                    }
                }
            } else {
                let c = unsafe { &*p };
                if c.id == id {
                    return Some(c);
                }
            }
            slot = (slot + 1) % CHUNK_TABLE_SIZE;
        }
        fatal!(
            "shadow arena exhausted: more than {} distinct {} KiB regions",
            CHUNK_TABLE_SIZE,
            CHUNK_SIZE / 1024
        );
    }

    /// The shadow cell for the 8-byte region containing `addr`,
    /// allocating its chunk on first touch.
    pub fn cell(&self, addr: usize) -> &[AtomicU64] {
        let c = self.chunk(addr, true).unwrap_or_else(|| unreachable!());
        let cell_idx = (addr & (CHUNK_SIZE - 1)) >> 3;
        &c.words[cell_idx * SHADOW_CNT..(cell_idx + 1) * SHADOW_CNT]
    }

    /// Stores `val` into every shadow word of every cell overlapping
    /// `[addr, addr + size)`. `addr` must be 8-aligned. Capped at
    /// `MAX_RESET_SIZE`; zero stores skip chunks that were never
    /// touched.
    pub fn range_set(&self, addr: usize, size: usize, val: u64) {
        debug_assert_eq!(addr % 8, 0);
        let size = size.min(MAX_RESET_SIZE);
        let size = (size + 7) & !7;
        let end = addr + size;
        let mut a = addr;
        while a < end {
            let chunk_end = end.min(((a >> CHUNK_SHIFT) + 1) << CHUNK_SHIFT);
            if let Some(c) = self.chunk(a, val != 0) {
                let first = (a & (CHUNK_SIZE - 1)) >> 3;
                let last = ((chunk_end - 1) & (CHUNK_SIZE - 1)) >> 3;
                for w in &c.words[first * SHADOW_CNT..(last + 1) * SHADOW_CNT] {
                    w.store(val, Ordering::Relaxed);
                }
            }
            a = chunk_end;
        }
    }
}

impl Drop for ShadowMemory {
    fn drop(&mut self) {
        for slot in self.table.iter() {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::SHADOW_FREED;

    fn cell_raw(mem: &ShadowMemory, addr: usize) -> Vec<u64> {
        mem.cell(addr)
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }

    #[test]
    fn fresh_cells_are_empty() {
        let mem = ShadowMemory::new();
        assert_eq!(cell_raw(&mem, 0x1000), vec![0; SHADOW_CNT]);
    }

    #[test]
    fn same_cell_for_all_bytes_of_a_region() {
        let mem = ShadowMemory::new();
        mem.cell(0x2000)[0].store(42, Ordering::Relaxed);
        assert_eq!(cell_raw(&mem, 0x2007)[0], 42);
        assert_eq!(cell_raw(&mem, 0x2008)[0], 0);
    }

    #[test]
    fn distant_addresses_hit_distinct_chunks() {
        let mem = ShadowMemory::new();
        mem.cell(0x10_0000)[1].store(7, Ordering::Relaxed);
        mem.cell(0x90_0000)[1].store(9, Ordering::Relaxed);
        assert_eq!(cell_raw(&mem, 0x10_0000)[1], 7);
        assert_eq!(cell_raw(&mem, 0x90_0000)[1], 9);
    }

    #[test]
    fn range_set_covers_every_overlapping_cell() {
        let mem = ShadowMemory::new();
        mem.range_set(0x3000, 24, SHADOW_FREED);
        for addr in &[0x3000usize, 0x3008, 0x3010] {
            assert_eq!(cell_raw(&mem, *addr), vec![SHADOW_FREED; SHADOW_CNT]);
        }
        assert_eq!(cell_raw(&mem, 0x3018), vec![0; SHADOW_CNT]);
    }

    #[test]
    fn range_set_rounds_size_up_to_a_cell() {
        let mem = ShadowMemory::new();
        mem.range_set(0x4000, 3, 5);
        assert_eq!(cell_raw(&mem, 0x4000), vec![5; SHADOW_CNT]);
    }

    #[test]
    fn zero_range_set_clears() {
        let mem = ShadowMemory::new();
        mem.cell(0x5000)[2].store(11, Ordering::Relaxed);
        mem.range_set(0x5000, 8, 0);
        assert_eq!(cell_raw(&mem, 0x5000), vec![0; SHADOW_CNT]);
    }

    #[test]
    fn range_set_crosses_chunk_boundary() {
        let mem = ShadowMemory::new();
        let boundary = CHUNK_SIZE * 3;
        mem.range_set(boundary - 8, 16, 1);
        assert_eq!(cell_raw(&mem, boundary - 8), vec![1; SHADOW_CNT]);
        assert_eq!(cell_raw(&mem, boundary), vec![1; SHADOW_CNT]);
    }
}
