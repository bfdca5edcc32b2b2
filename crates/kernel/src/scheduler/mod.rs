//! Ready queue and dispatch.
//!
//! Two disciplines share one thread shape: the default priority
//! discipline (donation-boosted effective priorities, see
//! [`crate::sync`]) and the fair-share discipline where priorities are
//! computed from `recent_cpu`, `nice` and the system load average.
//! Everything here runs with interrupts disabled on the single cpu,
//! which is the whole locking story for the scheduler state.

#[cfg(test)]
mod tests;

use core::cell::UnsafeCell;

use alloc::vec::Vec;

use crate::{
    arch, debug,
    thread::{self, PRI_MAX, Status, Thread, ThreadRef, Tid},
    utils::{fixed::Fixed, locks::LazyLock},
};

/// 59/60 in fixed point, the load average decay per second
static LOAD_DECAY: LazyLock<Fixed> = LazyLock::new(|| Fixed::from_int(59).div_int(60));

/// ticks a thread runs before it gets preempted
pub const TIME_SLICE: u64 = 4;

struct SchedState {
    ready: Vec<ThreadRef>,
    /// every live thread, the fair-share recomputations walk it
    all: Vec<ThreadRef>,
    idle: Option<ThreadRef>,
    current: ThreadRef,
    initial: ThreadRef,

    mlfqs: bool,
    load_avg: Fixed,

    /// ticks the current dispatch has been running
    slice_ticks: u64,
    /// deferred yield requested from interrupt context
    yield_pending: bool,
    /// a dead thread whose page the next pass reclaims
    pending_free: Option<ThreadRef>,

    next_tid: Tid,
}

struct SchedCell(UnsafeCell<Option<SchedState>>);

// guarded by interrupt-disable on the single cpu
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(None));

fn with_sched<R>(f: impl FnOnce(&mut SchedState) -> R) -> R {
    debug_assert!(
        !arch::interrupts_enabled(),
        "scheduler state touched with interrupts enabled"
    );
    let state = unsafe { &mut *SCHED.0.get() };
    f(state.as_mut().expect("scheduler used before init"))
}

/// Boots the scheduler: adopts the calling thread as the initial one,
/// spawns the idle thread and enables interrupts.
pub fn init(mlfqs: bool) {
    let boot = thread::adopt_boot_thread(1);
    unsafe {
        *SCHED.0.get() = Some(SchedState {
            ready: Vec::new(),
            all: alloc::vec![boot],
            idle: None,
            current: boot,
            initial: boot,
            mlfqs,
            load_avg: Fixed::ZERO,
            slice_ticks: 0,
            yield_pending: false,
            pending_free: None,
            next_tid: 2,
        });
    }

    arch::restore_interrupts(true);
    thread::spawn_idle();
    debug!(SchedState, "scheduler up, mlfqs: {mlfqs}");
}

pub(crate) fn allocate_tid() -> Tid {
    arch::without_interrupts(|| {
        with_sched(|s| {
            let tid = s.next_tid;
            s.next_tid += 1;
            tid
        })
    })
}

pub fn is_mlfqs() -> bool {
    arch::without_interrupts(|| with_sched(|s| s.mlfqs))
}

/// # interrupts must be disabled
pub(crate) fn register(thread: ThreadRef) {
    with_sched(|s| {
        if thread.is_idle() {
            s.idle = Some(thread);
        } else {
            s.all.push(thread);
        }
    });
}

/// # interrupts must be disabled
pub(crate) fn enqueue_ready(thread: ThreadRef) {
    with_sched(|s| {
        if !thread.is_idle() {
            debug_assert!(!s.ready.contains(&thread), "{thread:?} queued twice");
            s.ready.push(thread);
        }
    });
}

/// picks the highest effective priority, first come first served among
/// equals
fn pop_max_ready(s: &mut SchedState) -> Option<ThreadRef> {
    let mut best: Option<(usize, u8)> = None;
    for (index, t) in s.ready.iter().enumerate() {
        let priority = t.effective_priority();
        if best.is_none_or(|(_, p)| priority > p) {
            best = Some((index, priority));
        }
    }
    best.map(|(index, _)| s.ready.remove(index))
}

/// true when some ready thread strictly outranks the runner
pub(crate) fn higher_priority_ready() -> bool {
    with_sched(|s| {
        let current = s.current.effective_priority();
        s.ready.iter().any(|t| t.effective_priority() > current)
    })
}

pub(crate) fn request_preemption() {
    with_sched(|s| s.yield_pending = true);
}

/// Honors a deferred preemption request, called right after interrupt
/// handlers finish.
pub fn preempt_point() {
    if arch::in_interrupt() {
        return;
    }
    let pending = arch::without_interrupts(|| with_sched(|s| core::mem::take(&mut s.yield_pending)));
    if pending {
        thread::yield_now();
    }
}

/// Switches to the next runnable thread, or the idle thread when the
/// ready queue is empty. The caller has already moved the current
/// thread out of `Running` and must hold interrupts disabled.
pub(crate) fn schedule() {
    debug_assert!(!arch::interrupts_enabled());

    let (prev, next, exiting) = with_sched(|s| {
        let prev = s.current;
        debug_assert!(prev.status() != Status::Running);

        let next = pop_max_ready(s).unwrap_or_else(|| s.idle.expect("no idle thread"));
        next.set_status(Status::Running);
        s.current = next;
        s.slice_ticks = 0;
        arch::set_current_ptr(next.as_ptr() as *mut ());

        let exiting = prev.status() == Status::Dying;
        if exiting {
            assert!(prev != s.initial, "the boot thread cannot exit");
            debug_assert!(s.pending_free.is_none());
            s.all.retain(|t| *t != prev);
            s.pending_free = Some(prev);
        }
        (prev, next, exiting)
    });

    prev.check_magic();
    next.check_magic();

    if prev != next {
        unsafe { arch::context_switch(prev.context_ptr(), next.context_ptr(), exiting) };
    }
    finish_switch();
}

/// The tail every switched-in thread runs: reclaims the page of a
/// thread that exited and was switched away from for good.
pub(crate) fn finish_switch() {
    let dead = with_sched(|s| s.pending_free.take());
    if let Some(thread) = dead {
        debug_assert!(thread.status() == Status::Dying);
        let page = crate::memory::VirtAddr::from_ptr(thread.as_ptr());
        unsafe { core::ptr::drop_in_place(thread.as_ptr()) };
        crate::memory::palloc::free_page(page);
    }
}

/// # interrupts must be disabled
pub(crate) fn exit_current() -> ! {
    with_sched(|s| s.current.set_status(Status::Dying));
    schedule();
    unreachable!("schedule() returned to a dying thread");
}

/// Per-tick scheduler accounting, runs inside the timer interrupt.
pub(crate) fn on_tick(now: u64) {
    with_sched(|s| {
        let current = s.current;
        if s.mlfqs && !current.is_idle() {
            current.set_recent_cpu(current.recent_cpu().add_int(1));
        }

        if s.mlfqs && now % TIME_SLICE == 0 {
            mlfqs_refresh_all(s);
        }

        s.slice_ticks += 1;
        if s.slice_ticks >= TIME_SLICE {
            s.yield_pending = true;
        } else if s.mlfqs {
            let current_priority = current.effective_priority();
            if s.ready.iter().any(|t| t.effective_priority() > current_priority) {
                s.yield_pending = true;
            }
        }
    });
}

/// Once-a-second fair-share statistics: the load average first, then
/// every thread's `recent_cpu` decays against it.
pub(crate) fn on_second() {
    with_sched(|s| {
        if !s.mlfqs {
            return;
        }

        let running = if s.current.is_idle() { 0 } else { 1 };
        let ready_count = (s.ready.len() + running) as i32;
        s.load_avg = s.load_avg.mul(*LOAD_DECAY) + Fixed::from_int(ready_count).div_int(60);

        let twice_load = s.load_avg.mul_int(2);
        let decay = twice_load.div(twice_load.add_int(1));
        for thread in s.all.iter() {
            let recent = decay.mul(thread.recent_cpu()).add_int(thread.nice() as i32);
            thread.set_recent_cpu(recent);
        }
    });
}

fn mlfqs_priority(thread: &Thread) -> u8 {
    let raw = PRI_MAX as i32 - thread.recent_cpu().div_int(4).to_int_round()
        - thread.nice() as i32 * 2;
    raw.clamp(0, PRI_MAX as i32) as u8
}

/// # interrupts must be disabled
pub(crate) fn mlfqs_refresh_thread(thread: ThreadRef) {
    thread.set_both_priorities(mlfqs_priority(&thread));
}

fn mlfqs_refresh_all(s: &mut SchedState) {
    for thread in s.all.iter() {
        thread.set_both_priorities(mlfqs_priority(thread));
    }
    let current_priority = s.current.effective_priority();
    if s.ready.iter().any(|t| t.effective_priority() > current_priority) {
        s.yield_pending = true;
    }
}

/// system load average scaled by 100, the reporting shape
pub fn load_avg_hundredths() -> i32 {
    arch::without_interrupts(|| with_sched(|s| s.load_avg.to_hundredths()))
}

/// the current thread's `recent_cpu` scaled by 100
pub fn recent_cpu_hundredths() -> i32 {
    arch::without_interrupts(|| with_sched(|s| s.current.recent_cpu().to_hundredths()))
}

pub fn ready_count() -> usize {
    arch::without_interrupts(|| with_sched(|s| s.ready.len()))
}

fn find_thread(s: &SchedState, tid: Tid) -> Option<ThreadRef> {
    s.all.iter().copied().find(|t| t.tid() == tid)
}

/// a live thread's effective priority, observability for diagnostics
pub fn effective_priority_of(tid: Tid) -> Option<u8> {
    arch::without_interrupts(|| with_sched(|s| find_thread(s, tid).map(|t| t.effective_priority())))
}

pub fn status_of(tid: Tid) -> Option<Status> {
    arch::without_interrupts(|| with_sched(|s| find_thread(s, tid).map(|t| t.status())))
}
