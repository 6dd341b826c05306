use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::rtl::ThreadState;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

struct ExpectRace {
    addr: usize,
    size: usize,
    desc: String,
    hits: usize,
}

/// Program-source annotations the engine consults before building a
/// race report, plus the address ranges loaded from the
/// `ignore_regions` flag.
pub(crate) struct AnnotationTables {
    expect: Mutex<Vec<ExpectRace>>,
    benign: Mutex<Vec<(usize, usize)>>,
    ignore_ranges: Vec<(usize, usize)>,
}

impl AnnotationTables {
    pub fn new(ignore_file: Option<&Path>) -> AnnotationTables {
        let ignore_ranges = match ignore_file {
            Some(path) => match parse_ignore_file(path) {
                Ok(ranges) => ranges,
                Err(e) => {
                    log!(LogWarn, "cannot read ignore file {:?}: {}", path, e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        AnnotationTables {
            expect: Mutex::new(Vec::new()),
            benign: Mutex::new(Vec::new()),
            ignore_ranges,
        }
    }

    pub fn add_expect(&self, addr: usize, size: usize, desc: &str) {
        self.expect.lock().unwrap().push(ExpectRace {
            addr,
            size,
            desc: desc.to_string(),
            hits: 0,
        });
    }

    pub fn add_benign(&self, addr: usize, size: usize) {
        self.benign.lock().unwrap().push((addr, size));
    }

    /// True when `[addr, addr + size)` overlaps a declared expected
    /// race; the expectation's hit count is bumped.
    pub fn expect_report(&self, addr: usize, size: usize) -> bool {
        let mut expect = self.expect.lock().unwrap();
        for e in expect.iter_mut() {
            if ranges_overlap(addr, size, e.addr, e.size) {
                e.hits += 1;
                log!(LogDebug, "expected race at {:#x} fired", e.addr);
                return true;
            }
        }
        false
    }

    pub fn is_benign(&self, addr: usize, size: usize) -> bool {
        self.benign
            .lock()
            .unwrap()
            .iter()
            .any(|&(a, s)| ranges_overlap(addr, size, a, s))
    }

    pub fn is_ignored(&self, addr: usize) -> bool {
        self.ignore_ranges
            .iter()
            .any(|&(start, end)| addr >= start && addr < end)
    }

    /// Expected races that never fired, for finalize-time self-test
    /// reporting.
    pub fn unmet_expectations(&self) -> Vec<(usize, String)> {
        self.expect
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.hits == 0)
            .map(|e| (e.addr, e.desc.clone()))
            .collect()
    }
}

fn ranges_overlap(a: usize, asize: usize, b: usize, bsize: usize) -> bool {
    a + asize.max(1) > b && b + bsize.max(1) > a
}

/// One `0xSTART-0xEND` range per line; `#` starts a comment.
/// Function-name patterns belong to the external symbolizer-aware
/// collaborator and are not handled here.
fn parse_ignore_file(path: &Path) -> std::io::Result<Vec<(usize, usize)>> {
    let content = fs::read_to_string(path)?;
    let mut ranges = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let parsed = parse_range(line);
        match parsed {
            Some(range) => ranges.push(range),
            None => log!(LogWarn, "malformed ignore range {:?}", line),
        }
    }
    Ok(ranges)
}

fn parse_range(line: &str) -> Option<(usize, usize)> {
    let mut halves = line.splitn(2, '-');
    let start = parse_hex(halves.next()?.trim())?;
    let end = parse_hex(halves.next()?.trim())?;
    if end <= start {
        return None;
    }
    Some((start, end))
}

fn parse_hex(s: &str) -> Option<usize> {
    let digits = s.trim_start_matches("0x");
    usize::from_str_radix(digits, 16).ok()
}

/// Annotation entry points, mirroring the dynamic-annotation macros an
/// instrumented program may carry in its source.
impl ThreadState {
    /// Declares that a race on `[addr, addr + size)` is part of a
    /// self-test and must be swallowed (but counted).
    pub fn annotate_expect_race(&mut self, _pc: u64, addr: usize, size: usize, desc: &str) {
        self.ctx.annotations.add_expect(addr, size, desc);
    }

    /// Declares a known-benign race on `[addr, addr + size)`.
    pub fn annotate_benign_race(&mut self, _pc: u64, addr: usize, size: usize) {
        self.ctx.annotations.add_benign(addr, size);
    }

    /// One half of a user-declared happens-before arc.
    pub fn annotate_happens_before(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    /// The other half: observe every arc released at `addr`.
    pub fn annotate_happens_after(&mut self, pc: u64, addr: usize) {
        self.acquire(pc, addr);
    }

    // Producer-consumer queue annotations: a put happens-before the get
    // that dequeues the element; the queue address carries the edges.

    pub fn annotate_pcq_create(&mut self, pc: u64, addr: usize) {
        self.release_store(pc, addr);
    }

    pub fn annotate_pcq_put(&mut self, pc: u64, addr: usize) {
        self.release(pc, addr);
    }

    pub fn annotate_pcq_get(&mut self, pc: u64, addr: usize) {
        self.acquire(pc, addr);
    }

    pub fn annotate_pcq_destroy(&mut self, _pc: u64, addr: usize) {
        self.ctx.synctab.get_and_remove(addr);
    }
}
