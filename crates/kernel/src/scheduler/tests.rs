use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::vec::Vec;

use crate::test::{KernelTest, ktest};
use crate::thread::{self, PRI_DEFAULT, PRI_MAX, PRI_MIN, Status};
use crate::utils::locks::SpinLock;
use crate::{scheduler, time};

type Log = Arc<SpinLock<Vec<&'static str>>>;

#[test]
fn ready_queue_prefers_higher_priority() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let log: Log = Arc::new(SpinLock::new(Vec::new()));

        let mut tids = Vec::new();
        for (name, priority) in [("t20", 20), ("t50", 50), ("t40", 40)] {
            let log = log.clone();
            tids.push(thread::spawn(name, priority, move || {
                log.lock().push(name);
            }));
        }
        assert_eq!(scheduler::ready_count(), 3);

        // everybody outranks us now, they drain in priority order
        thread::set_priority(PRI_MIN);
        assert_eq!(&*log.lock(), &["t50", "t40", "t20"]);

        for tid in tids {
            assert_eq!(thread::wait(tid), Some(0));
        }
        thread::set_priority(PRI_DEFAULT);
    });
}

#[test]
fn spawned_thread_starts_ready_not_running() {
    ktest(|| {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let tid = thread::spawn("lazy", 10, move || {
            flag.store(true, Ordering::Relaxed);
        });

        // below our priority: parked in the ready queue untouched
        assert!(!ran.load(Ordering::Relaxed));
        assert_eq!(scheduler::status_of(tid), Some(Status::Ready));

        assert_eq!(thread::wait(tid), Some(0));
        assert!(ran.load(Ordering::Relaxed));
    });
}

#[test]
fn wait_returns_the_exit_status_once() {
    ktest(|| {
        let tid = thread::spawn("child", 40, || {
            thread::exit(7);
        });
        // the child outranked us and already finished
        assert_eq!(thread::wait(tid), Some(7));
        assert_eq!(thread::wait(tid), None);
    });
}

#[test]
fn higher_priority_spawn_preempts_immediately() {
    ktest(|| {
        let log: Log = Arc::new(SpinLock::new(Vec::new()));
        let inner = log.clone();
        log.lock().push("before");
        let tid = thread::spawn("urgent", 50, move || {
            inner.lock().push("urgent");
        });
        log.lock().push("after");
        assert_eq!(&*log.lock(), &["before", "urgent", "after"]);
        assert_eq!(thread::wait(tid), Some(0));
    });
}

#[test]
#[should_panic(expected = "out of range")]
fn spawn_with_invalid_priority_is_fatal() {
    thread::spawn("bad", PRI_MAX + 1, || {});
}

#[test]
fn mlfqs_statistics_after_one_second() {
    KernelTest::new().mlfqs().run(|| {
        for _ in 0..100 {
            time::interrupt_tick();
        }

        // one runnable thread: load_avg = 1/60 after the first second
        assert_eq!(scheduler::load_avg_hundredths(), 2);

        // recent_cpu accumulated one full second then decayed once
        let recent = scheduler::recent_cpu_hundredths();
        assert!((300..=340).contains(&recent), "recent_cpu was {recent}");

        // the last refresh ran at tick 100, before the decay
        assert_eq!(thread::priority(), 38);
    });
}

#[test]
fn mlfqs_ignores_set_priority_and_honors_nice() {
    KernelTest::new().mlfqs().run(|| {
        for _ in 0..100 {
            time::interrupt_tick();
        }
        let computed = thread::priority();
        thread::set_priority(10);
        assert_eq!(thread::priority(), computed, "set_priority must be a no-op");

        thread::set_nice(20);
        // decayed recent_cpu rounds to 1 quarter, nice costs 40
        assert_eq!(thread::priority(), 22);
        assert_eq!(thread::nice(), 20);

        // children inherit the fair-share statistics
        let tid = thread::spawn("heir", PRI_DEFAULT, || {});
        assert_eq!(scheduler::effective_priority_of(tid), Some(22));
        assert_eq!(thread::wait(tid), Some(0));

        thread::set_nice(0);
    });
}
