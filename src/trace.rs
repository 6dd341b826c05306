use crate::defs::{Epoch, MAX_STACK, TRACE_PART_SIZE};
use bit_field::BitField;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Must fit into 3 bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    EventTypeMop,
    EventTypeFuncEnter,
    EventTypeFuncExit,
    EventTypeLock,
    EventTypeUnlock,
    EventTypeRLock,
    EventTypeRUnlock,
}

impl EventType {
    fn from_bits(bits: u64) -> Option<EventType> {
        match bits {
            0 => Some(EventType::EventTypeMop),
            1 => Some(EventType::EventTypeFuncEnter),
            2 => Some(EventType::EventTypeFuncExit),
            3 => Some(EventType::EventTypeLock),
            4 => Some(EventType::EventTypeUnlock),
            5 => Some(EventType::EventTypeRLock),
            6 => Some(EventType::EventTypeRUnlock),
            _ => None,
        }
    }
}

/// A thread event: type in the top 3 bits, pc in the low 61.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event(u64);

impl Event {
    pub fn new(typ: EventType, pc: u64) -> Event {
        let mut x = pc & ((1 << 61) - 1);
        x.set_bits(61..64, typ as u64);
        Event(x)
    }

    pub fn typ(&self) -> Option<EventType> {
        EventType::from_bits(self.0.get_bits(61..64))
    }

    pub fn pc(&self) -> u64 {
        self.0.get_bits(0..61)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Captured at the moment execution enters a trace part: the epoch of
/// the first event that will land in it and the call stack at that
/// instant.
#[derive(Clone, Debug, Default)]
pub struct TraceHeader {
    pub epoch0: Epoch,
    pub stack0: Vec<u64>,
}

/// Per-thread ring of recent events, divided into equal parts. The
/// owning thread appends lock-free; part headers (and readers) go
/// through the mutex. Because epochs are dense, an epoch maps to its
/// slot and part in O(1).
pub struct Trace {
    headers: Mutex<Vec<TraceHeader>>,
    events: Box<[AtomicU64]>,
}

impl Trace {
    pub fn new(parts: usize) -> Trace {
        debug_assert!(parts.is_power_of_two());
        let mut headers = vec![TraceHeader::default(); parts];
        // Epoch 0 is never traced; the first part starts at 1.
        headers[0].epoch0 = 1;
        let events: Vec<AtomicU64> = (0..parts * TRACE_PART_SIZE)
            .map(|_| AtomicU64::new(0))
            .collect();
        Trace {
            headers: Mutex::new(headers),
            events: events.into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn add_event(&self, epoch: Epoch, typ: EventType, pc: u64) {
        let slot = (epoch % self.size() as u64) as usize;
        self.events[slot].store(Event::new(typ, pc).raw(), Ordering::Relaxed);
    }

    /// Called when `epoch` is the first epoch of a new part: stamps the
    /// part's header with the epoch and the caller's current stack.
    pub fn switch_part(&self, epoch: Epoch, stack: &[u64]) {
        debug_assert_eq!(epoch % TRACE_PART_SIZE as u64, 0);
        let mut headers = self.headers.lock().unwrap();
        let parts = headers.len();
        let idx = ((epoch / TRACE_PART_SIZE as u64) % parts as u64) as usize;
        headers[idx].epoch0 = epoch;
        headers[idx].stack0.clear();
        headers[idx].stack0.extend_from_slice(stack);
    }

    /// Reconstructs the call stack of the owning thread at `epoch`.
    /// Returns an empty stack when the epoch has already been evicted
    /// from the ring.
    pub fn restore_stack(&self, epoch: Epoch) -> Vec<u64> {
        let headers = self.headers.lock().unwrap();
        let parts = headers.len() as u64;
        let idx = ((epoch / TRACE_PART_SIZE as u64) % parts) as usize;
        let hdr = &headers[idx];
        if epoch < hdr.epoch0 || epoch - hdr.epoch0 >= TRACE_PART_SIZE as u64 {
            return Vec::new();
        }

        let mut buf = [0u64; MAX_STACK];
        let mut pos = hdr.stack0.len().min(MAX_STACK - 1);
        buf[..pos].copy_from_slice(&hdr.stack0[..pos]);

        let size = self.size() as u64;
        for e in hdr.epoch0..=epoch {
            let ev = Event(self.events[(e % size) as usize].load(Ordering::Relaxed));
            match ev.typ() {
                Some(EventType::EventTypeMop) => buf[pos] = ev.pc(),
                Some(EventType::EventTypeFuncEnter) => {
                    // We record the call pc; the frame below the callee
                    // is its return address, so offset by one.
                    buf[pos] = ev.pc().wrapping_sub(1);
                    if pos + 1 < MAX_STACK {
                        pos += 1;
                    }
                }
                Some(EventType::EventTypeFuncExit) => {
                    if pos > 0 {
                        pos -= 1;
                    }
                }
                // Lock events carry a pc for reports about the sync
                // object itself; they do not change the call stack.
                _ => {}
            }
        }
        if pos == 0 && buf[0] == 0 {
            return Vec::new();
        }
        buf[..pos + 1].to_vec()
    }
}
