//! End-to-end detector scenarios, driven the way an instrumentation
//! front-end would drive the engine. Every thread of the instrumented
//! program is modeled by its own `ThreadState`; the scenarios replay
//! interleavings event by event.

use rsan::interface;
use rsan::{Context, Flags, MutexCreateFlags, NoSuppressions, NoSymbolizer, ReportType, ThreadState};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn quiet_ctx(flags: Flags) -> Arc<Context> {
    Context::with_collaborators(
        flags,
        Box::new(io::sink()),
        Box::new(NoSymbolizer),
        Box::new(NoSuppressions),
    )
}

fn spawn(ctx: &Arc<Context>, parent: &mut ThreadState, handle: usize) -> ThreadState {
    let tid = parent.thread_create(0x1, handle, false);
    ctx.thread_start(tid)
}

#[test]
fn basic_race_is_reported() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x201, 0x1000);
    interface::memory_read_4(&mut b, 0x301, 0x1000);

    assert_eq!(ctx.reported_races(), 1);
    let reports = ctx.reports();
    assert_eq!(reports[0].typ, ReportType::ReportTypeRace);
    assert_eq!(reports[0].mops.len(), 2);
    assert_eq!(reports[0].mops[0].size, 4);
    assert_eq!(reports[0].mops[1].size, 4);
    assert!(!reports[0].mops[0].write);
    assert!(reports[0].mops[1].write);
    assert_eq!(reports[0].mops[0].tid, b.tid);
    assert_eq!(reports[0].mops[1].tid, a.tid);
}

#[test]
fn mutex_protected_accesses_do_not_race() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::mutex_create(&mut a, 0x10, 0x500, MutexCreateFlags::empty());

    interface::mutex_lock(&mut a, 0x11, 0x500);
    interface::memory_write_4(&mut a, 0x12, 0x2000);
    interface::mutex_unlock(&mut a, 0x13, 0x500);

    interface::mutex_lock(&mut b, 0x21, 0x500);
    interface::memory_read_4(&mut b, 0x22, 0x2000);
    interface::mutex_unlock(&mut b, 0x23, 0x500);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn same_thread_reread_is_a_same_info_hit() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();

    interface::memory_write_4(&mut a, 0x10, 0x3000);
    interface::memory_read_4(&mut a, 0x11, 0x3000);

    assert_eq!(ctx.reported_races(), 0);
    // The read did not store: one recorded access only.
    let occupied = ctx
        .shadow
        .cell(0x3000)
        .iter()
        .filter(|w| w.load(std::sync::atomic::Ordering::Relaxed) != 0)
        .count();
    assert_eq!(occupied, 1);
}

#[test]
fn use_after_free_races_with_the_sentinel() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_8(&mut a, 0x10, 0x4000);
    interface::memory_range_freed(&mut a, 0x11, 0x4000, 8);
    interface::memory_read_1(&mut b, 0x20, 0x4003);

    assert_eq!(ctx.reported_races(), 1);
    let reports = ctx.reports();
    assert_eq!(reports[0].typ, ReportType::ReportTypeUseAfterFree);
    assert_eq!(reports[0].mops.len(), 1);
    assert_eq!(reports[0].mops[0].size, 1);
    assert_eq!(reports[0].mops[0].addr, 0x4003);
    assert!(!reports[0].mops[0].write);
}

#[test]
fn overlapping_sizes_across_threads_race() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0x5000);
    interface::memory_write_2(&mut b, 0x20, 0x5002);

    assert_eq!(ctx.reported_races(), 1);
    let reports = ctx.reports();
    assert_eq!(reports[0].mops[0].size, 2);
    assert_eq!(reports[0].mops[0].addr, 0x5002);
    assert_eq!(reports[0].mops[1].size, 4);
    assert_eq!(reports[0].mops[1].addr, 0x5000);
}

#[test]
fn release_acquire_on_arbitrary_address_orders_accesses() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0x6000);
    interface::release(&mut a, 0x11, 0x7000);
    interface::acquire(&mut b, 0x20, 0x7000);
    interface::memory_read_4(&mut b, 0x21, 0x6000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn join_orders_child_accesses_before_joiner() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut b, 0x20, 0x8000);
    interface::thread_finish(&mut b);
    interface::thread_join(&mut a, 0x10, 100);
    interface::memory_read_4(&mut a, 0x11, 0x8000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn unjoined_child_accesses_still_race() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut b, 0x20, 0x8100);
    interface::thread_finish(&mut b);
    interface::memory_read_4(&mut a, 0x11, 0x8100);

    assert_eq!(ctx.reported_races(), 1);
}

#[test]
fn write_range_behaves_like_per_byte_writes() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    // 11 bytes from an aligned base: one 8-byte access plus three
    // byte accesses.
    interface::memory_write_range(&mut a, 0x10, 0x9000, 11);
    interface::memory_read_1(&mut b, 0x20, 0x9005);
    interface::memory_read_1(&mut b, 0x21, 0x9009);

    assert_eq!(ctx.reported_races(), 2);
}

#[test]
fn reset_range_forgets_history() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0xa000);
    ctx.memory_reset_range(0xa000, 4);
    interface::memory_read_4(&mut b, 0x20, 0xa000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn report_cap_counts_but_stops_emitting() {
    let mut flags = Flags::default();
    flags.max_reported_races = 1;
    let ctx = quiet_ctx(flags);
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0xb000);
    interface::memory_write_4(&mut b, 0x20, 0xb000);
    interface::memory_write_4(&mut a, 0x11, 0xb100);
    interface::memory_write_4(&mut b, 0x21, 0xb100);

    assert_eq!(ctx.reported_races(), 2);
    assert_eq!(ctx.reports().len(), 1);
}

#[test]
fn expected_race_is_swallowed_and_counted() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    a.annotate_expect_race(0x1, 0xc000, 4, "self test");
    interface::memory_write_4(&mut a, 0x10, 0xc000);
    interface::memory_write_4(&mut b, 0x20, 0xc000);

    assert_eq!(ctx.reported_races(), 0);
    assert_eq!(ctx.finalize(), 0);
}

#[test]
fn unmet_expected_race_warns_at_finalize() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    a.annotate_expect_race(0x1, 0xc100, 4, "never fires");
    assert_eq!(ctx.finalize(), 0);
    assert_eq!(ctx.warnings(), 1);
}

#[test]
fn benign_race_annotation_suppresses() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    a.annotate_benign_race(0x1, 0xd000, 8);
    interface::memory_write_4(&mut a, 0x10, 0xd000);
    interface::memory_write_4(&mut b, 0x20, 0xd000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn happens_before_arc_annotation_orders() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0xe000);
    a.annotate_happens_before(0x11, 0xe800);
    b.annotate_happens_after(0x20, 0xe800);
    interface::memory_write_4(&mut b, 0x21, 0xe000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn pcq_put_get_orders_producer_and_consumer() {
    let ctx = quiet_ctx(Flags::default());
    let mut producer = ctx.main_thread();
    let mut consumer = spawn(&ctx, &mut producer, 100);

    producer.annotate_pcq_create(0x1, 0xf800);
    interface::memory_write_4(&mut producer, 0x10, 0xf000);
    producer.annotate_pcq_put(0x11, 0xf800);
    consumer.annotate_pcq_get(0x20, 0xf800);
    interface::memory_read_4(&mut consumer, 0x21, 0xf000);

    assert_eq!(ctx.reported_races(), 0);
}

#[test]
fn finalize_returns_configured_exit_status() {
    let mut flags = Flags::default();
    flags.exit_status_on_race = 42;
    let ctx = quiet_ctx(flags);
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    assert_eq!(ctx.finalize(), 0);
    interface::memory_write_4(&mut a, 0x10, 0x1000);
    interface::memory_write_4(&mut b, 0x20, 0x1000);
    assert_eq!(ctx.finalize(), 42);
}

#[test]
fn text_report_names_both_accesses() {
    let sink = SharedSink::default();
    let ctx = Context::with_collaborators(
        Flags::default(),
        Box::new(sink.clone()),
        Box::new(NoSymbolizer),
        Box::new(NoSuppressions),
    );
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::func_enter(&mut b, 0x700);
    interface::memory_write_4(&mut a, 0x10, 0x1000);
    interface::memory_write_4(&mut b, 0x20, 0x1000);

    let text = sink.contents();
    assert!(text.contains("WARNING: rsan: data race at 0x1000"));
    assert!(text.contains("Write of size 4 at 0x1000 by thread T1"));
    assert!(text.contains("Previous Write of size 4 at 0x1000 by thread T0"));
    // The racy access itself is the innermost frame.
    assert!(text.contains("#0 0x20"));
}

#[test]
fn structured_report_is_line_delimited_json() {
    let sink = SharedSink::default();
    let mut flags = Flags::default();
    flags.structured_reports = true;
    let ctx = Context::with_collaborators(
        flags,
        Box::new(sink.clone()),
        Box::new(NoSymbolizer),
        Box::new(NoSuppressions),
    );
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0x1000);
    interface::memory_read_4(&mut b, 0x20, 0x1000);

    let text = sink.contents();
    let line = text.lines().next().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(parsed["typ"], "ReportTypeRace");
    assert_eq!(parsed["addr"], 0x1000);
    assert_eq!(parsed["mops"].as_array().unwrap().len(), 2);
}

#[test]
fn ignore_regions_file_suppresses_races() {
    let path = std::env::temp_dir().join(format!("rsan-ignore-{}.txt", std::process::id()));
    std::fs::write(&path, "# allocator scratch\n0x12000-0x13000\n").unwrap();

    let mut flags = Flags::default();
    flags.ignore_regions = Some(path.clone());
    let ctx = quiet_ctx(flags);
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::memory_write_4(&mut a, 0x10, 0x12500);
    interface::memory_write_4(&mut b, 0x20, 0x12500);
    interface::memory_write_4(&mut a, 0x11, 0x13500);
    interface::memory_write_4(&mut b, 0x21, 0x13500);

    assert_eq!(ctx.reported_races(), 1);
    std::fs::remove_file(&path).ok();
}

#[test]
fn reports_reconstruct_stacks_from_traces() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);

    interface::func_enter(&mut a, 0x100);
    interface::func_enter(&mut a, 0x200);
    interface::memory_write_4(&mut a, 0x210, 0x1000);
    interface::func_exit(&mut a);

    interface::memory_read_4(&mut b, 0x300, 0x1000);

    let reports = ctx.reports();
    assert_eq!(reports.len(), 1);
    // The old access's stack is rebuilt at its epoch: both frames were
    // still live and the racy pc tops the stack.
    let old_stack: Vec<u64> = reports[0].mops[1].stack.iter().map(|f| f.pc).collect();
    assert_eq!(old_stack, vec![0xff, 0x1ff, 0x210]);
    let new_stack: Vec<u64> = reports[0].mops[0].stack.iter().map(|f| f.pc).collect();
    assert_eq!(new_stack, vec![0x300]);
}

#[test]
fn creator_chain_appears_in_report() {
    let ctx = quiet_ctx(Flags::default());
    let mut a = ctx.main_thread();
    let mut b = spawn(&ctx, &mut a, 100);
    let mut c = spawn(&ctx, &mut b, 200);

    interface::memory_write_4(&mut a, 0x10, 0x1000);
    interface::memory_write_4(&mut c, 0x30, 0x1000);

    let reports = ctx.reports();
    let chain: Vec<(u32, Option<u32>)> = reports[0]
        .threads
        .iter()
        .map(|t| (t.tid, t.creator_tid))
        .collect();
    assert!(chain.contains(&(c.tid, Some(b.tid))));
    assert!(chain.contains(&(b.tid, Some(a.tid))));
    assert!(chain.contains(&(a.tid, None)));
}
