//! Report grouping, ordering and rendering through the public API

use lockstat::cli::OutputFormat;
use lockstat::error::Result;
use lockstat::event::{CallSiteId, EventSink, LockAddress, LockEvent, ThreadId};
use lockstat::profiler::LockProfiler;
use lockstat::report::{Report, Reporter, MISSING_STACK};
use lockstat::symbols::SymbolResolver;

#[derive(Default)]
struct CountingSymbols {
    refreshes: usize,
}

impl SymbolResolver for CountingSymbols {
    fn refresh_code_ranges(&mut self) -> Result<()> {
        self.refreshes += 1;
        Ok(())
    }

    fn decode(&self, address: u64) -> String {
        format!("sym+0x{:x}", address)
    }
}

fn wait_on(profiler: &LockProfiler, thread: u32, lock: u64, site: u64, wait: u64) {
    profiler.handle(LockEvent::AttemptStart {
        thread: ThreadId(thread),
        lock: LockAddress(lock),
        timestamp_ns: 0,
    });
    profiler.handle(LockEvent::AttemptEnd {
        thread: ThreadId(thread),
        timestamp_ns: wait,
        call_site: Some(CallSiteId(site)),
        success: false,
    });
}

#[test]
fn test_thread_rows_sorted_by_descending_wait() {
    let profiler = LockProfiler::default();
    wait_on(&profiler, 5, 0xa, 1, 300);
    wait_on(&profiler, 5, 0xb, 1, 100);
    wait_on(&profiler, 5, 0xc, 1, 200);

    let report = Report::collect(&profiler, &CountingSymbols::default());
    let order: Vec<u64> = report.threads[0]
        .locks
        .iter()
        .map(|row| row.stat.wait_time_ns)
        .collect();
    assert_eq!(order, vec![300, 200, 100]);

    let mut out = Vec::new();
    report.write_text(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let first = text.find("wait time 0.30us").unwrap();
    let second = text.find("wait time 0.20us").unwrap();
    let third = text.find("wait time 0.10us").unwrap();
    assert!(first < second && second < third);
}

#[test]
fn test_unknown_lock_uses_symbolic_address() {
    let profiler = LockProfiler::default();
    wait_on(&profiler, 1, 0xdead, 1, 10);
    let text = render(&profiler);
    assert!(text.contains("\tlock sym+0xdead ::: wait time"));
    assert!(text.contains(MISSING_STACK));
}

#[test]
fn test_init_stacks_printed_first() {
    let profiler = LockProfiler::default();
    profiler.on_stack(CallSiteId(1), &[0x10, 0x20]);
    profiler.handle(LockEvent::Init {
        lock: LockAddress(0xbeef),
        call_site: Some(CallSiteId(1)),
    });
    wait_on(&profiler, 1, 0xbeef, 1, 10);

    let text = render(&profiler);
    assert!(text.starts_with("init stack for lock beef (#1)\n"));
    assert!(text.contains(&format!("\t\t{:>16} (10)\n", "sym+0x10")));
    assert!(text.contains("\tlock #1 ::: wait time 0.01us ::: hold time 0.00us ::: enter count 0"));
    assert!(text.find("thread 1").unwrap() > text.find("init stack").unwrap());
}

#[test]
fn test_each_pass_refreshes_and_accumulates() {
    let profiler = LockProfiler::default();
    let mut symbols = CountingSymbols::default();
    let mut reporter = Reporter::new(OutputFormat::Text);

    wait_on(&profiler, 1, 0xa, 1, 1_000);
    let mut first = Vec::new();
    reporter.pass(&profiler, &mut symbols, &mut first).unwrap();

    wait_on(&profiler, 1, 0xa, 1, 2_000);
    let mut second = Vec::new();
    reporter.pass(&profiler, &mut symbols, &mut second).unwrap();

    assert_eq!(symbols.refreshes, 2);
    assert_eq!(reporter.passes(), 2);
    assert!(String::from_utf8(first).unwrap().contains("wait time 1.00us"));
    assert!(String::from_utf8(second).unwrap().contains("wait time 3.00us"));
}

#[test]
fn test_histogram_tables_follow_threads() {
    let profiler = LockProfiler::default();
    wait_on(&profiler, 1, 0xa, 1, 50_000);
    let text = render(&profiler);

    let wait_header = text.find("wait time (us)").unwrap();
    let hold_header = text.find("hold time (us)").unwrap();
    assert!(text.find("thread 1").unwrap() < wait_header);
    assert!(wait_header < hold_header);
    assert!(text.contains("        32 -> 63         : 1"));
}

fn render(profiler: &LockProfiler) -> String {
    let mut out = Vec::new();
    Report::collect(profiler, &CountingSymbols::default())
        .write_text(&mut out)
        .unwrap();
    String::from_utf8(out).unwrap()
}
