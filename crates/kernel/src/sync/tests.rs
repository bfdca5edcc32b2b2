use std::boxed::Box;
use std::sync::Arc;
use std::vec::Vec;

use crate::scheduler;
use crate::sync::{Condvar, Lock, Semaphore};
use crate::test::ktest;
use crate::thread::{self, PRI_DEFAULT, PRI_MAX};
use crate::utils::locks::SpinLock;

type Log = Arc<SpinLock<Vec<&'static str>>>;

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn new_log() -> Log {
    Arc::new(SpinLock::new(Vec::new()))
}

/// lets every ready thread above `floor` run, then takes the cpu back
fn let_others_run(floor: u8) {
    thread::set_priority(floor);
    thread::set_priority(PRI_MAX);
}

#[test]
fn semaphore_hands_off_in_priority_order() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let sem = leak(Semaphore::new(0));
        let log = new_log();

        for (name, priority) in [("w10", 10), ("w30", 30)] {
            let log = log.clone();
            thread::spawn(name, priority, move || {
                sem.down();
                log.lock().push(name);
            });
        }
        // both run and park on the semaphore
        let_others_run(5);
        assert!(sem.has_waiters());

        sem.up();
        sem.up();
        thread::set_priority(0);
        assert_eq!(&*log.lock(), &["w30", "w10"]);
        thread::set_priority(PRI_DEFAULT);
    });
}

#[test]
fn up_preempts_when_the_waiter_outranks_us() {
    ktest(|| {
        let sem = leak(Semaphore::new(0));
        let log = new_log();
        let inner = log.clone();
        thread::spawn("hi", 50, move || {
            sem.down();
            inner.lock().push("woke");
        });

        log.lock().push("pre");
        sem.up();
        log.lock().push("post");
        assert_eq!(&*log.lock(), &["pre", "woke", "post"]);
    });
}

#[test]
fn try_down_never_blocks() {
    ktest(|| {
        let sem = Semaphore::new(1);
        assert!(sem.try_down());
        assert!(!sem.try_down());
        sem.up();
        assert!(sem.try_down());
    });
}

#[test]
fn transitive_donation_chain() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let l1 = leak(Lock::new());
        let l2 = leak(Lock::new());
        let go_low = leak(Semaphore::new(0));
        let log = new_log();

        let log_low = log.clone();
        let t_low = thread::spawn("low", 10, move || {
            l1.acquire();
            go_low.down();
            l1.release();
            log_low.lock().push("low");
        });
        let_others_run(5); // low takes L1 and parks on go_low
        assert_eq!(scheduler::effective_priority_of(t_low), Some(10));

        let log_med = log.clone();
        let t_med = thread::spawn("med", 20, move || {
            l2.acquire();
            l1.acquire();
            // both donations reached us while we waited
            assert_eq!(thread::priority(), 30);
            l2.release();
            l1.release();
            log_med.lock().push("med");
        });
        let_others_run(5); // med takes L2, blocks on L1
        assert_eq!(scheduler::effective_priority_of(t_low), Some(20));

        let log_high = log.clone();
        let t_high = thread::spawn("high", 30, move || {
            l2.acquire();
            l2.release();
            log_high.lock().push("high");
        });
        let_others_run(5); // high blocks on L2
        assert_eq!(scheduler::effective_priority_of(t_med), Some(30));
        assert_eq!(scheduler::effective_priority_of(t_low), Some(30));

        // let the chain unwind
        go_low.up();
        thread::set_priority(0);

        assert_eq!(&*log.lock(), &["high", "med", "low"]);
        for tid in [t_low, t_med, t_high] {
            assert_eq!(thread::wait(tid), Some(0));
        }
        thread::set_priority(PRI_DEFAULT);
    });
}

#[test]
fn release_recomputes_from_remaining_locks() {
    ktest(|| {
        let la = leak(Lock::new());
        let lb = leak(Lock::new());
        la.acquire();
        lb.acquire();

        let a_tid = thread::spawn("wait_a", 45, move || {
            la.acquire();
            la.release();
        });
        let b_tid = thread::spawn("wait_b", 50, move || {
            lb.acquire();
            lb.release();
        });
        // both donors blocked on their locks right at spawn
        assert_eq!(thread::priority(), 50);

        lb.release(); // drops the 50 donation, the 45 one remains
        assert_eq!(thread::priority(), 45);
        la.release();
        assert_eq!(thread::priority(), PRI_DEFAULT);

        for tid in [a_tid, b_tid] {
            assert_eq!(thread::wait(tid), Some(0));
        }
    });
}

#[test]
fn set_priority_under_active_donation() {
    ktest(|| {
        let lock = leak(Lock::new());
        lock.acquire();
        let donor = thread::spawn("donor", 50, move || {
            lock.acquire();
            lock.release();
        });

        let cur = thread::current();
        assert_eq!(thread::priority(), 50);
        assert_eq!(cur.base_priority(), PRI_DEFAULT);

        // equal to the donated level and above base: base moves up
        thread::set_priority(50);
        assert_eq!(cur.base_priority(), 50);
        assert_eq!(thread::priority(), 50);

        // lowering the base does not shake off the donation
        thread::set_priority(PRI_DEFAULT);
        assert_eq!(thread::priority(), 50);

        lock.release();
        assert_eq!(thread::priority(), PRI_DEFAULT);
        assert_eq!(thread::wait(donor), Some(0));
    });
}

#[test]
fn try_acquire_does_not_wait() {
    ktest(|| {
        let lock = leak(Lock::new());
        assert!(lock.try_acquire());

        let tid = thread::spawn("prober", 40, move || {
            assert!(!lock.try_acquire());
        });
        assert_eq!(thread::wait(tid), Some(0));

        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    });
}

#[test]
#[should_panic(expected = "recursive acquire")]
fn recursive_acquire_is_fatal() {
    ktest(|| {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
    });
}

#[test]
#[should_panic(expected = "does not hold")]
fn releasing_an_unheld_lock_is_fatal() {
    ktest(|| {
        let lock = Lock::new();
        lock.release();
    });
}

#[test]
fn condvar_signals_highest_priority_waiter() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let lock = leak(Lock::new());
        let cond = leak(Condvar::new());
        let log = new_log();

        // the low-priority consumer parks on the condition first
        let log_low = log.clone();
        let t_low = thread::spawn("c_low", 10, move || {
            lock.acquire();
            cond.wait(lock);
            log_low.lock().push("c_low");
            lock.release();
        });
        let_others_run(5);

        let log_high = log.clone();
        let t_high = thread::spawn("c_high", 30, move || {
            lock.acquire();
            cond.wait(lock);
            log_high.lock().push("c_high");
            lock.release();
        });
        let_others_run(5);

        // waiting order is [c_low, c_high], wake order must not be
        lock.acquire();
        assert!(cond.signal(lock));
        lock.release();
        let_others_run(5);
        assert_eq!(&*log.lock(), &["c_high"]);

        lock.acquire();
        assert!(cond.signal(lock));
        assert!(!cond.signal(lock));
        lock.release();
        let_others_run(5);
        assert_eq!(&*log.lock(), &["c_high", "c_low"]);

        for tid in [t_low, t_high] {
            assert_eq!(thread::wait(tid), Some(0));
        }
        thread::set_priority(PRI_DEFAULT);
    });
}

#[test]
fn broadcast_wakes_every_waiter() {
    ktest(|| {
        thread::set_priority(PRI_MAX);
        let lock = leak(Lock::new());
        let cond = leak(Condvar::new());
        let log = new_log();

        let mut tids = Vec::new();
        for (name, priority) in [("a", 20), ("b", 25)] {
            let log = log.clone();
            tids.push(thread::spawn(name, priority, move || {
                lock.acquire();
                cond.wait(lock);
                log.lock().push(name);
                lock.release();
            }));
        }
        let_others_run(5);

        lock.acquire();
        cond.broadcast(lock);
        lock.release();
        thread::set_priority(0);

        assert_eq!(&*log.lock(), &["b", "a"]);
        for tid in tids {
            assert_eq!(thread::wait(tid), Some(0));
        }
        thread::set_priority(PRI_DEFAULT);
    });
}
