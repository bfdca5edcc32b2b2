//! Wall-clock ticks and the sleep queue.
//!
//! The timer driver is external: it calls [`tick`] on every raw tick
//! and [`sec_tick`] once a second. [`interrupt_tick`] bundles both plus
//! the deferred preemption for callers that stand in for the interrupt
//! glue (the hosted idle loop, tests).

#[cfg(test)]
mod tests;

use core::{cell::UnsafeCell, sync::atomic::AtomicU64, sync::atomic::Ordering};

use alloc::vec::Vec;

use crate::{
    arch, scheduler,
    thread::{self, NOT_SLEEPING, ThreadRef},
};

pub const TICKS_PER_SEC: u64 = 100;
const MS_PER_TICK: u64 = 1000 / TICKS_PER_SEC;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// sleeping threads ordered by ascending wake tick, ties in arrival
/// order
struct SleepList(UnsafeCell<Vec<ThreadRef>>);

// guarded by interrupt-disable on the single cpu
unsafe impl Sync for SleepList {}

static SLEEPERS: SleepList = SleepList(UnsafeCell::new(Vec::new()));

fn sleepers() -> &'static mut Vec<ThreadRef> {
    debug_assert!(!arch::interrupts_enabled());
    unsafe { &mut *SLEEPERS.0.get() }
}

/// ticks since boot
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// milliseconds since boot, the resolution is a whole tick
pub fn boot_ms() -> u64 {
    ticks() * MS_PER_TICK
}

pub(crate) fn reset() {
    TICKS.store(0, Ordering::Relaxed);
    arch::without_interrupts(|| sleepers().clear());
}

/// Blocks the current thread until the clock reaches `deadline`. A
/// deadline already in the past still gives up the cpu for one
/// scheduling turn.
pub fn sleep_until(deadline: u64) {
    assert!(!arch::in_interrupt(), "sleep in interrupt context");

    if deadline <= ticks() {
        thread::yield_now();
        return;
    }

    let were_enabled = arch::disable_interrupts();
    let cur = thread::current();
    cur.set_wake_at(deadline);
    let list = sleepers();
    let at = list
        .iter()
        .position(|t| t.wake_at() > deadline)
        .unwrap_or(list.len());
    list.insert(at, cur);
    thread::block();
    arch::restore_interrupts(were_enabled);
}

/// Blocks the current thread for `count` ticks.
pub fn sleep_ticks(count: u64) {
    sleep_until(ticks() + count)
}

/// Unblocks every sleeper whose deadline has been reached, returning
/// the next pending deadline. Runs with interrupts disabled.
pub(crate) fn wake(now: u64) -> Option<u64> {
    let list = sleepers();
    while let Some(&head) = list.first() {
        if head.wake_at() > now {
            break;
        }
        list.remove(0);
        head.set_wake_at(NOT_SLEEPING);
        thread::unblock(head);
        thread::maybe_preempt();
    }
    list.first().map(|t| t.wake_at())
}

/// One raw timer tick. Called by the timer glue with interrupts
/// disabled, on the interrupt path.
pub fn tick() {
    debug_assert!(!arch::interrupts_enabled());
    arch::enter_interrupt();
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
    scheduler::on_tick(now);
    wake(now);
    arch::leave_interrupt();
}

/// The once-a-second statistics update, same calling rules as [`tick`].
pub fn sec_tick() {
    debug_assert!(!arch::interrupts_enabled());
    arch::enter_interrupt();
    scheduler::on_second();
    arch::leave_interrupt();
}

/// A whole simulated timer interrupt: the raw tick, the second rollover
/// when due, then whatever preemption the handler requested.
pub fn interrupt_tick() {
    let were_enabled = arch::disable_interrupts();
    tick();
    if ticks().is_multiple_of(TICKS_PER_SEC) {
        sec_tick();
    }
    arch::restore_interrupts(were_enabled);
    scheduler::preempt_point();
}
