use crate::defs::{Epoch, Tid};
use crate::rtl::{Context, ThreadState};
use crate::shadow::Shadow;
use crate::thread::ThreadStatus;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum ReportType {
    ReportTypeRace,
    ReportTypeUseAfterFree,
    ReportTypeUnlockOfUnlocked,
    ReportTypeDestroyLocked,
    ReportTypeDoubleInit,
    ReportTypeBrokenIgnore,
    ReportTypeExpectedRaceNotFound,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFrame {
    pub pc: u64,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ReportFrame {
    fn raw(pc: u64) -> ReportFrame {
        ReportFrame {
            pc,
            function: None,
            file: None,
            line: None,
        }
    }
}

/// One of the two memory operations of a race.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMop {
    pub tid: Tid,
    pub addr: usize,
    pub size: u64,
    pub write: bool,
    pub stack: Vec<ReportFrame>,
    /// Addresses of mutexes the thread held at the access, when known.
    pub locks_held: Vec<usize>,
}

/// One entry of a creator chain.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportThread {
    pub tid: Tid,
    pub reuse_count: u32,
    pub status: String,
    pub creator_tid: Option<Tid>,
    pub parent_epoch: Epoch,
    pub creation_stack: Vec<ReportFrame>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub typ: ReportType,
    pub addr: usize,
    pub description: String,
    pub mops: Vec<ReportMop>,
    pub threads: Vec<ReportThread>,
}

/// Turns a pc into source frames. Lives outside the core; the default
/// produces raw-pc frames.
pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, pc: u64) -> Vec<ReportFrame>;
}

pub struct NoSymbolizer;

impl Symbolizer for NoSymbolizer {
    fn symbolize(&self, _pc: u64) -> Vec<ReportFrame> {
        Vec::new()
    }
}

/// Suppression-file matching. Lives outside the core; the default
/// suppresses nothing.
pub trait SuppressionEngine: Send + Sync {
    fn is_suppressed(&self, report: &Report) -> bool;
}

pub struct NoSuppressions;

impl SuppressionEngine for NoSuppressions {
    fn is_suppressed(&self, _report: &Report) -> bool {
        false
    }
}

struct ReportState {
    sink: Box<dyn Write + Send>,
    reports: Vec<Report>,
    nreported: usize,
    nwarnings: usize,
}

/// Serializes report construction and emission. Builders take the
/// report lock first and the thread registry lock (for stack
/// reconstruction) second; nothing takes them in the other order.
pub struct ReportBuilder {
    state: Mutex<ReportState>,
    symbolizer: Box<dyn Symbolizer>,
    suppressions: Box<dyn SuppressionEngine>,
}

impl ReportBuilder {
    pub fn new(
        sink: Box<dyn Write + Send>,
        symbolizer: Box<dyn Symbolizer>,
        suppressions: Box<dyn SuppressionEngine>,
    ) -> ReportBuilder {
        ReportBuilder {
            state: Mutex::new(ReportState {
                sink,
                reports: Vec::new(),
                nreported: 0,
                nwarnings: 0,
            }),
            symbolizer,
            suppressions,
        }
    }

    pub fn reported_races(&self) -> usize {
        self.state.lock().unwrap().nreported
    }

    pub fn warnings(&self) -> usize {
        self.state.lock().unwrap().nwarnings
    }

    pub fn reports(&self) -> Vec<Report> {
        self.state.lock().unwrap().reports.clone()
    }

    fn symbolize_stack(&self, pcs: &[u64]) -> Vec<ReportFrame> {
        let mut frames = Vec::with_capacity(pcs.len());
        for &pc in pcs {
            let symbolized = self.symbolizer.symbolize(pc);
            if symbolized.is_empty() {
                frames.push(ReportFrame::raw(pc));
            } else {
                frames.extend(symbolized);
            }
        }
        frames
    }

    /// A warning about the instrumented program's API usage; never a
    /// race, never rate limited.
    pub(crate) fn misuse(&self, rep: Report, structured: bool) {
        let mut state = self.state.lock().unwrap();
        state.nwarnings += 1;
        let rendered = render(&rep, structured);
        let _ = state.sink.write_all(rendered.as_bytes());
        let _ = state.sink.flush();
    }

    pub(crate) fn special_report(&self, typ: ReportType, addr: usize, description: &str) {
        self.misuse(
            Report {
                typ,
                addr,
                description: description.to_string(),
                mops: Vec::new(),
                threads: Vec::new(),
            },
            false,
        );
    }

    pub(crate) fn write_summary(&self, races: usize) {
        if races == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let _ = writeln!(state.sink, "rsan: reported {} warnings", races);
        let _ = state.sink.flush();
    }
}

/// Builds and emits a race report for the conflicting pair
/// `(cur, old)` at `addr`.
pub(crate) fn report_race(ctx: &Context, thr: &ThreadState, addr: usize, cur: Shadow, old: Shadow) {
    let cell = addr & !7;
    // Expected and benign races are judged on the union of the two
    // access ranges.
    let (min_addr, max_addr) = {
        let a0 = cell + cur.addr0() as usize;
        let a1 = cell + old.addr0() as usize;
        let e0 = a0 + cur.size() as usize;
        let e1 = a1 + old.size() as usize;
        (a0.min(a1), e0.max(e1))
    };
    if ctx.annotations.expect_report(min_addr, max_addr - min_addr) {
        return;
    }
    if ctx.annotations.is_benign(min_addr, max_addr - min_addr) {
        return;
    }
    if ctx.annotations.is_ignored(min_addr) {
        return;
    }

    let builder = &ctx.report;
    let mut state = builder.state.lock().unwrap();

    let typ = if old.is_freed() {
        ReportType::ReportTypeUseAfterFree
    } else {
        ReportType::ReportTypeRace
    };
    let mut mops = vec![mop_of(ctx, builder, cell, cur, Some(thr))];
    if !old.is_freed() {
        mops.push(mop_of(ctx, builder, cell, old, None));
    }

    let mut threads = Vec::new();
    collect_thread_chain(ctx, builder, cur.tid(), &mut threads);
    if !old.is_freed() && !Shadow::tids_equal(cur, old) {
        collect_thread_chain(ctx, builder, old.tid(), &mut threads);
    }

    let description = match typ {
        ReportType::ReportTypeUseAfterFree => format!(
            "use of heap-freed memory at {:#x}",
            cell + cur.addr0() as usize
        ),
        _ => format!("data race at {:#x}", cell + cur.addr0() as usize),
    };
    let rep = Report {
        typ,
        addr: cell + cur.addr0() as usize,
        description,
        mops,
        threads,
    };

    if builder.suppressions.is_suppressed(&rep) {
        return;
    }

    state.nreported += 1;
    if state.nreported > ctx.flags.max_reported_races {
        // Still counted; the summary reflects the true total.
        return;
    }
    let rendered = render_race(&rep, ctx.flags.verbosity, ctx.flags.structured_reports);
    let _ = state.sink.write_all(rendered.as_bytes());
    let _ = state.sink.flush();
    state.reports.push(rep);
}

/// An API-misuse warning (bad unlock, double init, broken ignore...),
/// attributed to the current thread's live stack.
pub(crate) fn report_misuse(
    ctx: &Context,
    thr: &ThreadState,
    addr: usize,
    typ: ReportType,
    description: &str,
) {
    let builder = &ctx.report;
    let stack = builder.symbolize_stack(&thr.shadow_stack);
    let rep = Report {
        typ,
        addr,
        description: description.to_string(),
        mops: vec![ReportMop {
            tid: thr.tid,
            addr,
            size: 0,
            write: false,
            stack,
            locks_held: thr.mset.iter().map(|h| h.addr).collect(),
        }],
        threads: Vec::new(),
    };
    builder.misuse(rep, ctx.flags.structured_reports);
}

fn mop_of(
    ctx: &Context,
    builder: &ReportBuilder,
    cell: usize,
    s: Shadow,
    thr: Option<&ThreadState>,
) -> ReportMop {
    let pcs = ctx.restore_stack(s.tid(), s.epoch());
    ReportMop {
        tid: s.tid(),
        addr: cell + s.addr0() as usize,
        size: s.size(),
        write: s.is_write(),
        stack: builder.symbolize_stack(&pcs),
        locks_held: match thr {
            Some(t) => t.mset.iter().map(|h| h.addr).collect(),
            None => Vec::new(),
        },
    }
}

fn status_name(status: ThreadStatus) -> &'static str {
    match status {
        ThreadStatus::ThreadStatusInvalid => "invalid",
        ThreadStatus::ThreadStatusCreated => "created",
        ThreadStatus::ThreadStatusRunning => "running",
        ThreadStatus::ThreadStatusFinished => "finished",
        ThreadStatus::ThreadStatusDead => "dead",
    }
}

/// Walks `creator_tid` links up from `tid`, oldest ancestor last.
fn collect_thread_chain(
    ctx: &Context,
    builder: &ReportBuilder,
    tid: Tid,
    out: &mut Vec<ReportThread>,
) {
    const MAX_CHAIN: usize = 8;
    let mut chain = Vec::new();
    {
        let reg = ctx.registry.lock().unwrap();
        let mut next = Some(tid);
        while let Some(t) = next {
            if chain.len() >= MAX_CHAIN || out.iter().any(|r: &ReportThread| r.tid == t) {
                break;
            }
            let tctx = match reg.get(t) {
                Some(tctx) => tctx,
                None => break,
            };
            chain.push((
                tctx.tid,
                tctx.reuse_count,
                tctx.status,
                tctx.creator_tid,
                tctx.parent_epoch,
                tctx.creation_stack.clone(),
            ));
            next = tctx.creator_tid;
        }
    }
    for (tid, reuse_count, status, creator_tid, parent_epoch, pcs) in chain {
        out.push(ReportThread {
            tid,
            reuse_count,
            status: status_name(status).to_string(),
            creator_tid,
            parent_epoch,
            creation_stack: builder.symbolize_stack(&pcs),
        });
    }
}

fn access_word(write: bool) -> &'static str {
    if write {
        "Write"
    } else {
        "Read"
    }
}

fn render_stack(out: &mut String, stack: &[ReportFrame]) {
    // Innermost frame first, numbered the way debuggers print them.
    for (i, frame) in stack.iter().rev().enumerate() {
        match &frame.function {
            Some(f) => out.push_str(&format!(
                "    #{} {:#x} {} {}:{}\n",
                i,
                frame.pc,
                f,
                frame.file.as_deref().unwrap_or("?"),
                frame.line.unwrap_or(0)
            )),
            None => out.push_str(&format!("    #{} {:#x}\n", i, frame.pc)),
        }
    }
}

fn render_race(rep: &Report, verbosity: u64, structured: bool) -> String {
    if structured {
        return render(rep, true);
    }
    let mut out = String::new();
    out.push_str(&format!("WARNING: rsan: {}\n", rep.description));
    for (i, mop) in rep.mops.iter().enumerate() {
        let prev = if i == 0 { "" } else { "Previous " };
        out.push_str(&format!(
            "  {}{} of size {} at {:#x} by thread T{}:\n",
            prev,
            access_word(mop.write),
            mop.size,
            mop.addr,
            mop.tid
        ));
        render_stack(&mut out, &mop.stack);
        if verbosity >= 2 && !mop.locks_held.is_empty() {
            let held: Vec<String> = mop.locks_held.iter().map(|a| format!("{:#x}", a)).collect();
            out.push_str(&format!("    holding mutexes: {}\n", held.join(", ")));
        }
    }
    if verbosity >= 1 {
        for t in &rep.threads {
            match t.creator_tid {
                Some(c) => {
                    out.push_str(&format!(
                        "  Thread T{} ({}) created by thread T{} at:\n",
                        t.tid, t.status, c
                    ));
                    render_stack(&mut out, &t.creation_stack);
                }
                None => {
                    out.push_str(&format!("  Thread T{} ({}) is the main thread\n", t.tid, t.status));
                }
            }
        }
    }
    out
}

fn render(rep: &Report, structured: bool) -> String {
    if structured {
        match serde_json::to_string(rep) {
            Ok(mut s) => {
                s.push('\n');
                s
            }
            Err(_) => String::new(),
        }
    } else {
        format!("WARNING: rsan: {}\n", rep.description)
    }
}
