//! Instrumentation hook behaviour under real runtime calls
//!
//! Covers concurrent callers, re-entrant recursion across threads, watch-set
//! changes mid-flight and coexistence with a pre-existing observer.

use fntrace::runtime::{CallEvent, CallObserver, FrameInfo, Runtime};
use fntrace::workload::Workload;
use fntrace::InstrumentationHook;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn traced_workload() -> (Arc<InstrumentationHook>, Arc<Workload>) {
    let runtime = Arc::new(Runtime::new());
    let workload = Arc::new(Workload::register(Arc::clone(&runtime)));
    let hook = Arc::new(InstrumentationHook::new(runtime));
    (hook, workload)
}

#[test]
fn test_many_threads_calling_watched_functions() {
    let (hook, workload) = traced_workload();
    let report = hook.enable(["workload.fib", "workload.checksum"]);
    assert!(report.failed.is_empty());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let workload = Arc::clone(&workload);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0u32..100 {
                    workload.fib(6);
                    workload.checksum(&i.to_be_bytes());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = hook.disable();
    // fib(6) makes 25 frames
    assert_eq!(stats["workload.fib"].call_count, 8 * 100 * 25);
    assert_eq!(stats["workload.checksum"].call_count, 8 * 100);
    for record in stats.values() {
        assert!(record.min_time <= record.max_time);
        assert!(record.total_time >= record.max_time);
    }
}

#[test]
fn test_snapshots_while_threads_run_are_consistent() {
    let (hook, workload) = traced_workload();
    hook.enable(["workload.checksum"]);

    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let workload = Arc::clone(&workload);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0u64..500 {
                    workload.checksum(&i.to_le_bytes());
                }
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    while done.load(Ordering::SeqCst) < 4 {
        if let Some(record) = hook.get_results().get("workload.checksum") {
            if record.call_count > 0 {
                assert!(record.total_time >= record.max_time);
                assert!(record.min_time <= record.max_time);
            } else {
                assert_eq!(record.total_time, 0.0);
            }
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(hook.disable()["workload.checksum"].call_count, 2000);
}

#[test]
fn test_watch_set_change_keeps_remaining_stats() {
    let (hook, workload) = traced_workload();
    hook.enable(["workload.fib", "workload.checksum"]);
    workload.fib(4);
    workload.checksum(b"abc");

    hook.update(["workload.fib"]).unwrap();
    workload.fib(4);
    workload.checksum(b"abc");

    let stats = hook.disable();
    assert_eq!(stats["workload.fib"].call_count, 18);
    // No longer watched, but its history is kept
    assert_eq!(stats["workload.checksum"].call_count, 1);
}

#[test]
fn test_disable_when_never_enabled() {
    let (hook, _workload) = traced_workload();
    assert!(hook.disable().is_empty());
    assert!(!hook.is_enabled());
}

struct Counting(AtomicUsize);

impl CallObserver for Counting {
    fn observe(&self, _frame: &FrameInfo, event: CallEvent) {
        if event == CallEvent::Call {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_existing_observer_sees_every_call() {
    let (hook, workload) = traced_workload();
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    hook.runtime().set_observer(counting.clone());

    hook.enable(["workload.checksum"]);
    workload.fib(3);
    workload.checksum(b"x");
    let stats = hook.disable();

    // 5 fib frames plus 1 checksum frame, traced or not
    assert_eq!(counting.0.load(Ordering::SeqCst), 6);
    assert_eq!(stats["workload.checksum"].call_count, 1);
    assert!(!stats.contains_key("workload.fib"));

    workload.fib(1);
    assert_eq!(counting.0.load(Ordering::SeqCst), 7);
}
