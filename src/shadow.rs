use crate::defs::{Epoch, Tid, CLK_BITS, MAX_EPOCH, SHADOW_FREED, TID_BITS};
use bit_field::BitField;
use static_assertions::assert_eq_size;

const CLK_SHIFT: usize = 6;
const TID_SHIFT: usize = 64 - TID_BITS;

assert_eq_size!(FastState, u64);
assert_eq_size!(Shadow, u64);

/// The per-thread state the hot path needs: tid and current epoch,
/// packed exactly like the high bits of a shadow word so a shadow word
/// is built from it with two OR instructions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FastState(u64);

impl FastState {
    pub fn new(tid: Tid, epoch: Epoch) -> FastState {
        debug_assert!((tid as u64) < (1 << TID_BITS));
        debug_assert!(epoch <= MAX_EPOCH);
        FastState(((tid as u64) << TID_SHIFT) | (epoch << CLK_SHIFT))
    }

    pub fn tid(&self) -> Tid {
        self.0.get_bits(TID_SHIFT..64) as Tid
    }

    pub fn epoch(&self) -> Epoch {
        self.0.get_bits(CLK_SHIFT..CLK_SHIFT + CLK_BITS)
    }

    pub fn increment_epoch(&mut self) {
        debug_assert!(self.epoch() < MAX_EPOCH);
        self.0 += 1 << CLK_SHIFT;
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One recorded access to an 8-byte shadow cell, packed into 64 bits:
///
///   tid      : TID_BITS (high)
///   epoch    : CLK_BITS
///   is_write : 1
///   size_log : 2
///   addr0    : 3 (low)
///
/// All-zero is an empty slot. `SHADOW_FREED` marks freed memory and
/// conflicts with any concurrent access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Shadow(u64);

impl Shadow {
    pub fn from_raw(x: u64) -> Shadow {
        Shadow(x)
    }

    /// A shadow word for the current access of `fast`'s thread; the
    /// low 6 bits are filled in by the setters below.
    pub fn new(fast: FastState) -> Shadow {
        Shadow(fast.raw())
    }

    pub fn set_addr0_and_size_log(&mut self, addr0: u64, size_log: u64) {
        debug_assert_eq!(self.0 & 31, 0);
        debug_assert!(addr0 <= 7);
        debug_assert!(size_log <= 3);
        self.0 |= (size_log << 3) | addr0;
    }

    pub fn set_write(&mut self, is_write: bool) {
        debug_assert_eq!(self.0 & 32, 0);
        if is_write {
            self.0 |= 32;
        }
    }

    pub fn tid(&self) -> Tid {
        self.0.get_bits(TID_SHIFT..64) as Tid
    }

    pub fn epoch(&self) -> Epoch {
        self.0.get_bits(CLK_SHIFT..CLK_SHIFT + CLK_BITS)
    }

    pub fn addr0(&self) -> u64 {
        self.0 & 7
    }

    pub fn size_log(&self) -> u64 {
        (self.0 >> 3) & 3
    }

    pub fn size(&self) -> u64 {
        1 << self.size_log()
    }

    pub fn is_write(&self) -> bool {
        self.0 & 32 != 0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_freed(&self) -> bool {
        self.0 == SHADOW_FREED
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn tids_equal(s1: Shadow, s2: Shadow) -> bool {
        (s1.0 ^ s2.0) >> TID_SHIFT == 0
    }

    /// The 5 bits (size_log, addr0) are identical.
    pub fn addr0_and_size_equal(s1: Shadow, s2: Shadow) -> bool {
        (s1.0 ^ s2.0) & 31 == 0
    }

    pub fn two_ranges_intersect(s1: Shadow, s2: Shadow) -> bool {
        s1.addr0() + s1.size() > s2.addr0() && s2.addr0() + s2.size() > s1.addr0()
    }

    /// Starting slot for the cell scan. Repeated accesses to the same
    /// offset within an 8-byte block hit their own shadow word straight
    /// off instead of scanning half the cell on average.
    pub fn search_offset(&self) -> usize {
        (self.0 & 7) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(tid: Tid, epoch: Epoch, addr0: u64, size_log: u64, is_write: bool) -> Shadow {
        let mut s = Shadow::new(FastState::new(tid, epoch));
        s.set_addr0_and_size_log(addr0, size_log);
        s.set_write(is_write);
        s
    }

    #[test]
    fn fast_state_round_trip() {
        let mut fs = FastState::new(0x1234, 77);
        assert_eq!(fs.tid(), 0x1234);
        assert_eq!(fs.epoch(), 77);
        fs.increment_epoch();
        assert_eq!(fs.tid(), 0x1234);
        assert_eq!(fs.epoch(), 78);
    }

    #[test]
    fn shadow_round_trip() {
        for &tid in &[0u32, 1, 0x7fff, 0xffff] {
            for &epoch in &[1u64, 42, MAX_EPOCH] {
                for addr0 in 0..8u64 {
                    for size_log in 0..4u64 {
                        if addr0 + (1 << size_log) > 8 {
                            continue;
                        }
                        for &is_write in &[false, true] {
                            let s = mk(tid, epoch, addr0, size_log, is_write);
                            assert_eq!(s.tid(), tid);
                            assert_eq!(s.epoch(), epoch);
                            assert_eq!(s.addr0(), addr0);
                            assert_eq!(s.size_log(), size_log);
                            assert_eq!(s.size(), 1 << size_log);
                            assert_eq!(s.is_write(), is_write);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn empty_and_freed() {
        assert!(Shadow::from_raw(0).is_zero());
        let freed = Shadow::from_raw(SHADOW_FREED);
        assert!(freed.is_freed());
        assert!(freed.is_write());
        assert_eq!(freed.addr0(), 0);
        assert_eq!(freed.size(), 8);
    }

    #[test]
    fn tid_comparison_ignores_everything_else() {
        let a = mk(7, 100, 0, 2, true);
        let b = mk(7, 999, 4, 0, false);
        let c = mk(8, 100, 0, 2, true);
        assert!(Shadow::tids_equal(a, b));
        assert!(!Shadow::tids_equal(a, c));
    }

    #[test]
    fn addr0_and_size_comparison() {
        let a = mk(1, 10, 4, 1, true);
        let b = mk(2, 20, 4, 1, false);
        let c = mk(1, 10, 4, 0, true);
        let d = mk(1, 10, 2, 1, true);
        assert!(Shadow::addr0_and_size_equal(a, b));
        assert!(!Shadow::addr0_and_size_equal(a, c));
        assert!(!Shadow::addr0_and_size_equal(a, d));
    }

    #[test]
    fn range_intersection() {
        // [0,4) vs [2,4): overlap.
        let a = mk(1, 1, 0, 2, true);
        let b = mk(2, 2, 2, 1, true);
        assert!(Shadow::two_ranges_intersect(a, b));
        assert!(Shadow::two_ranges_intersect(b, a));
        // [0,2) vs [2,3): adjacent, no overlap.
        let c = mk(1, 1, 0, 1, true);
        let d = mk(2, 2, 2, 0, true);
        assert!(!Shadow::two_ranges_intersect(c, d));
        assert!(!Shadow::two_ranges_intersect(d, c));
        // [0,8) covers everything.
        let e = mk(1, 1, 0, 3, true);
        let f = mk(2, 2, 7, 0, false);
        assert!(Shadow::two_ranges_intersect(e, f));
    }

    #[test]
    fn search_offset_is_addr0() {
        assert_eq!(mk(1, 1, 5, 0, false).search_offset(), 5);
        assert_eq!(mk(1, 1, 0, 3, true).search_offset(), 0);
    }
}
