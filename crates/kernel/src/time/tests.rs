use std::sync::Arc;
use std::vec::Vec;

use crate::test::ktest;
use crate::thread::{self, PRI_DEFAULT, PRI_MAX};
use crate::time;
use crate::utils::locks::SpinLock;

type Log = Arc<SpinLock<Vec<&'static str>>>;

#[test]
fn sleep_until_the_past_just_yields() {
    ktest(|| {
        let before = time::ticks();
        time::sleep_until(0);
        time::sleep_until(before);
        // no tick source ran, we only gave up the cpu for a turn
        assert_eq!(time::ticks(), before);
    });
}

#[test]
fn sleepers_wake_in_deadline_order() {
    ktest(|| {
        let log: Log = Arc::new(SpinLock::new(Vec::new()));

        let log_a = log.clone();
        let slow = thread::spawn("slow", 40, move || {
            time::sleep_ticks(3);
            log_a.lock().push("slow");
        });
        let log_b = log.clone();
        let quick = thread::spawn("quick", 50, move || {
            time::sleep_ticks(1);
            log_b.lock().push("quick");
        });

        // both outran us and are asleep now
        assert!(log.lock().is_empty());
        for _ in 0..4 {
            time::interrupt_tick();
        }

        assert_eq!(&*log.lock(), &["quick", "slow"]);
        assert_eq!(thread::wait(slow), Some(0));
        assert_eq!(thread::wait(quick), Some(0));
    });
}

#[test]
fn the_idle_thread_drives_the_clock_while_everyone_sleeps() {
    ktest(|| {
        let before = time::ticks();
        time::sleep_ticks(5);
        assert!(time::ticks() >= before + 5);
    });
}

#[test]
fn time_slice_expiry_round_robins_equal_priorities() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let log: Log = Arc::new(SpinLock::new(Vec::new()));

        let mut tids = Vec::new();
        for name in ["a", "b"] {
            let log = log.clone();
            tids.push(thread::spawn(name, 40, move || {
                for _ in 0..2 {
                    log.lock().push(name);
                    for _ in 0..crate::scheduler::TIME_SLICE {
                        time::interrupt_tick();
                    }
                }
            }));
        }

        thread::set_priority(0);
        assert_eq!(&*log.lock(), &["a", "b", "a", "b"]);
        for tid in tids {
            assert_eq!(thread::wait(tid), Some(0));
        }
        thread::set_priority(PRI_DEFAULT);
    });
}

#[test]
fn wakeup_preempts_a_lower_priority_runner() {
    ktest(|| {
        let log: Log = Arc::new(SpinLock::new(Vec::new()));
        let inner = log.clone();
        let tid = thread::spawn("napper", 60, move || {
            time::sleep_ticks(2);
            inner.lock().push("napper");
        });

        log.lock().push("tick1");
        time::interrupt_tick();
        log.lock().push("tick2");
        // the second tick reaches the deadline: the napper outranks us
        // and runs before interrupt_tick returns
        time::interrupt_tick();
        log.lock().push("after");

        assert_eq!(&*log.lock(), &["tick1", "tick2", "napper", "after"]);
        assert_eq!(thread::wait(tid), Some(0));
    });
}
