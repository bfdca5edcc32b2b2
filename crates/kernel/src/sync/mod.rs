//! Blocking synchronisation: semaphores, donation-aware locks and Mesa
//! condition variables.
//!
//! These are the primitives threads suspend on. Their state is guarded
//! by interrupt-disable on the single cpu, the spin locks in
//! `utils::locks` are for data, never for waiting.

#[cfg(test)]
mod tests;

use core::{cell::Cell, cell::UnsafeCell, ptr::NonNull};

use alloc::vec::Vec;

use crate::{
    arch,
    thread::{self, PRI_MIN, ThreadRef},
};

/// Waiters parked on a semaphore, kept ordered by effective priority
/// (descending, first come first served among equals). Donation can
/// boost a parked thread after insertion, so selection still scans for
/// the maximum rather than trusting the head blindly.
#[derive(Debug)]
pub(crate) struct WaitList(Vec<ThreadRef>);

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn insert(&mut self, thread: ThreadRef) {
        let priority = thread.effective_priority();
        let at = self
            .0
            .iter()
            .position(|t| t.effective_priority() < priority)
            .unwrap_or(self.0.len());
        self.0.insert(at, thread);
    }

    /// re-establishes the descending order after a donation changed a
    /// parked thread's priority
    pub(crate) fn resort(&mut self) {
        // stable: equal priorities keep their arrival order
        self.0.sort_by(|a, b| b.effective_priority().cmp(&a.effective_priority()));
    }

    pub(crate) fn pop_highest(&mut self) -> Option<ThreadRef> {
        let mut best: Option<(usize, u8)> = None;
        for (index, t) in self.0.iter().enumerate() {
            let priority = t.effective_priority();
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((index, priority));
            }
        }
        best.map(|(index, _)| self.0.remove(index))
    }

    pub(crate) fn top_priority(&self) -> Option<u8> {
        self.0.iter().map(|t| t.effective_priority()).max()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    value: Cell<u32>,
    waiters: UnsafeCell<WaitList>,
}

// guarded by interrupt-disable on the single cpu
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            value: Cell::new(value),
            waiters: UnsafeCell::new(WaitList::new()),
        }
    }

    /// Waits until the counter is positive, then decrements it. May
    /// suspend, so never legal in interrupt context.
    pub fn down(&self) {
        assert!(!arch::in_interrupt(), "semaphore down in interrupt context");
        let were_enabled = arch::disable_interrupts();

        while self.value.get() == 0 {
            unsafe { &mut *self.waiters.get() }.insert(thread::current());
            thread::block();
        }
        self.value.set(self.value.get() - 1);

        arch::restore_interrupts(were_enabled);
    }

    /// Decrements the counter iff it is positive, without waiting.
    pub fn try_down(&self) -> bool {
        arch::without_interrupts(|| {
            if self.value.get() > 0 {
                self.value.set(self.value.get() - 1);
                true
            } else {
                false
            }
        })
    }

    /// Increments the counter, first waking the highest-priority waiter
    /// if any. Safe from interrupt context, where the preemption this
    /// may want is deferred to the handler's exit.
    pub fn up(&self) {
        let were_enabled = arch::disable_interrupts();
        let woken = unsafe { &mut *self.waiters.get() }.pop_highest();
        if let Some(waiter) = woken {
            thread::unblock(waiter);
        }
        self.value.set(self.value.get() + 1);
        arch::restore_interrupts(were_enabled);

        if woken.is_some() {
            thread::maybe_preempt();
        }
    }

    pub(crate) fn top_waiter_priority(&self) -> Option<u8> {
        arch::without_interrupts(|| unsafe { &*self.waiters.get() }.top_priority())
    }

    pub(crate) fn resort_waiters(&self) {
        debug_assert!(!arch::interrupts_enabled());
        unsafe { &mut *self.waiters.get() }.resort();
    }

    pub fn has_waiters(&self) -> bool {
        arch::without_interrupts(|| !unsafe { &*self.waiters.get() }.is_empty())
    }
}

/// donation chains are walked this many hops at most, anything deeper
/// is silently capped
const DONATION_DEPTH_MAX: usize = 8;

/// A mutual exclusion lock that donates priority: while a thread waits
/// on it, the holder (and transitively whatever the holder waits on)
/// runs with at least the waiter's effective priority.
#[derive(Debug)]
pub struct Lock {
    holder: Cell<Option<ThreadRef>>,
    sema: Semaphore,
}

// guarded by interrupt-disable on the single cpu
unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            holder: Cell::new(None),
            sema: Semaphore::new(1),
        }
    }

    pub fn holder(&self) -> Option<ThreadRef> {
        arch::without_interrupts(|| self.holder.get())
    }

    pub fn held_by_current(&self) -> bool {
        self.holder() == Some(thread::current())
    }

    /// Acquires the lock, donating the caller's priority down the
    /// holder chain while it waits.
    pub fn acquire(&self) {
        assert!(!arch::in_interrupt(), "lock acquire in interrupt context");
        let cur = thread::current();
        assert!(
            self.holder.get() != Some(cur),
            "recursive acquire of a lock by {cur:?}"
        );

        let were_enabled = arch::disable_interrupts();
        if self.holder.get().is_some() {
            cur.set_waiting_on(Some(NonNull::from(self)));
            donate_chain(cur);
        }
        self.sema.down();
        self.holder.set(Some(cur));
        cur.set_waiting_on(None);
        unsafe { cur.held_locks() }.push(NonNull::from(self));
        arch::restore_interrupts(were_enabled);
    }

    /// Acquires without waiting. On success any priority already parked
    /// on the lock still boosts the new holder.
    pub fn try_acquire(&self) -> bool {
        assert!(!arch::in_interrupt(), "lock acquire in interrupt context");
        let cur = thread::current();
        assert!(
            self.holder.get() != Some(cur),
            "recursive acquire of a lock by {cur:?}"
        );

        arch::without_interrupts(|| {
            if !self.sema.try_down() {
                return false;
            }
            self.holder.set(Some(cur));
            unsafe { cur.held_locks() }.push(NonNull::from(self));
            if let Some(top) = self.sema.top_waiter_priority()
                && top > cur.effective_priority()
            {
                cur.set_effective_priority(top);
            }
            true
        })
    }

    /// Releases the lock, dropping whatever priority its waiters were
    /// donating and waking the highest-priority one.
    pub fn release(&self) {
        let cur = thread::current();
        assert!(
            self.holder.get() == Some(cur),
            "{cur:?} released a lock it does not hold"
        );

        let were_enabled = arch::disable_interrupts();
        let held = unsafe { cur.held_locks() };
        let index = held
            .iter()
            .position(|l| core::ptr::eq(l.as_ptr(), self))
            .expect("held lock missing from the owner list");
        held.remove(index);
        self.holder.set(None);

        // back to the base priority plus what the remaining locks'
        // waiters still donate
        let old = cur.effective_priority();
        let mut effective = cur.base_priority();
        for lock in held.iter() {
            if let Some(top) = unsafe { lock.as_ref() }.sema.top_waiter_priority() {
                effective = effective.max(top);
            }
        }
        cur.set_effective_priority(effective);

        self.sema.up();
        arch::restore_interrupts(were_enabled);

        if effective < old {
            thread::maybe_preempt();
        }
    }

    pub(crate) fn top_waiter_priority(&self) -> Option<u8> {
        self.sema.top_waiter_priority()
    }
}

/// Walks `donor -> lock holder -> that holder's blocker -> ...`, raising
/// each effective priority that falls short of the donor's. Interrupts
/// are disabled. Chains longer than [`DONATION_DEPTH_MAX`] are cut off.
fn donate_chain(donor: ThreadRef) {
    let mut donor = donor;
    for _ in 0..DONATION_DEPTH_MAX {
        let Some(lock) = donor.waiting_on() else {
            break;
        };
        let Some(holder) = (unsafe { lock.as_ref() }.holder.get()) else {
            break;
        };
        debug_assert!(holder != donor, "donation cycle through {donor:?}");

        if donor.effective_priority() <= holder.effective_priority() {
            // nothing to raise here, so nothing further up either
            break;
        }
        holder.set_effective_priority(donor.effective_priority());

        // the holder may itself be parked somewhere, keep that waiter
        // list ordered under its new priority
        if let Some(blocking) = holder.waiting_on() {
            unsafe { blocking.as_ref() }.sema.resort_waiters();
        }
        donor = holder;
    }
}

/// A Mesa-style condition variable: `signal` is a hint, the woken
/// waiter re-checks its predicate under the lock.
#[derive(Debug)]
pub struct Condvar {
    /// one private semaphore per parked waiter
    waiters: UnsafeCell<Vec<NonNull<Semaphore>>>,
}

// guarded by interrupt-disable on the single cpu
unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// Atomically releases `lock` and waits for a signal, reacquiring
    /// the lock before returning. The semaphore the caller parks on
    /// lives on its stack and leaves the list before it is ever upped.
    pub fn wait(&self, lock: &Lock) {
        assert!(!arch::in_interrupt(), "condvar wait in interrupt context");
        assert!(lock.held_by_current(), "condvar wait without the lock");

        let waiter = Semaphore::new(0);
        arch::without_interrupts(|| {
            unsafe { &mut *self.waiters.get() }.push(NonNull::from(&waiter));
        });

        lock.release();
        waiter.down();
        lock.acquire();
    }

    /// Wakes the waiter whose parked thread has the highest effective
    /// priority. Returns whether anybody was waiting.
    pub fn signal(&self, lock: &Lock) -> bool {
        assert!(!arch::in_interrupt(), "condvar signal in interrupt context");
        assert!(lock.held_by_current(), "condvar signal without the lock");

        let picked = arch::without_interrupts(|| {
            let waiters = unsafe { &mut *self.waiters.get() };
            let mut best: Option<(usize, u8)> = None;
            for (index, sema) in waiters.iter().enumerate() {
                let priority = unsafe { sema.as_ref() }
                    .top_waiter_priority()
                    .unwrap_or(PRI_MIN);
                if best.is_none_or(|(_, p)| priority > p) {
                    best = Some((index, priority));
                }
            }
            best.map(|(index, _)| waiters.remove(index))
        });

        match picked {
            Some(sema) => {
                unsafe { sema.as_ref() }.up();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        while self.signal(lock) {}
    }
}
