//! Host-thread backend used by the test harness.
//!
//! Every kernel thread is carried by a host thread that is parked on a
//! gate. The context switch releases the target's gate and parks on the
//! caller's, so exactly one kernel thread ever runs at a time and the
//! scheduler keeps full control of the interleaving. "Halting" while
//! idle injects a simulated timer interrupt, which is what drives the
//! clock forward in tests.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::memory::VirtAddr;

static INTERRUPTS_ON: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ON.load(Ordering::Relaxed)
}

pub(super) unsafe fn raw_disable_interrupts() {
    INTERRUPTS_ON.store(false, Ordering::Relaxed);
}

pub(super) unsafe fn raw_enable_interrupts() {
    INTERRUPTS_ON.store(true, Ordering::Relaxed);
}

/// the running thread's descriptor, maintained by the scheduler right
/// before each switch (the bare metal backend derives it from the stack
/// pointer instead)
static CURRENT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn set_current_ptr(ptr: *mut ()) {
    CURRENT.store(ptr, Ordering::Relaxed);
}

pub fn current_ptr() -> *mut () {
    CURRENT.load(Ordering::Relaxed)
}

/// halts simulated by injecting ticks, bounded so a scheduling bug
/// fails the test instead of hanging it
static IDLE_TICKS: AtomicU64 = AtomicU64::new(0);
const IDLE_TICK_LIMIT: u64 = 1_000_000;

pub(crate) fn reset_idle_watchdog() {
    IDLE_TICKS.store(0, Ordering::Relaxed);
}

/// waits for "the next timer interrupt": delivers one simulated tick
pub fn halt_until_interrupt() {
    assert!(interrupts_enabled(), "halted with interrupts disabled");
    if IDLE_TICKS.fetch_add(1, Ordering::Relaxed) > IDLE_TICK_LIMIT {
        panic!("idle for {IDLE_TICK_LIMIT} ticks, no thread ever became runnable");
    }
    crate::time::interrupt_tick();
}

pub fn console_write(s: &str) {
    eprint!("{s}");
}

#[derive(Debug)]
struct Gate {
    running: Mutex<bool>,
    condvar: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn release(&self) {
        let mut running = self.running.lock().unwrap();
        *running = true;
        self.condvar.notify_one();
    }

    fn wait(&self) {
        let mut running = self.running.lock().unwrap();
        while !*running {
            running = self.condvar.wait(running).unwrap();
        }
        *running = false;
    }
}

#[derive(Debug)]
pub struct Context {
    gate: Arc<Gate>,
}

impl Context {
    /// context for a fresh kernel thread: its host carrier starts parked
    /// and enters the common thread trampoline on first switch-in
    pub fn new_spawned(_stack_top: VirtAddr) -> Self {
        let gate = Gate::new();
        let carrier = gate.clone();
        std::thread::Builder::new()
            .spawn(move || {
                carrier.wait();
                // a panicking kernel thread must not silently strand the
                // threads waiting on it, take the whole run down instead
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    crate::thread::kernel_thread_entry();
                }));
                if outcome.is_err() {
                    eprintln!("kernel thread panicked, aborting");
                    std::process::abort();
                }
            })
            .expect("failed to spawn host carrier thread");
        Self { gate }
    }

    /// context for the boot thread, which is already running on the
    /// caller's own host thread
    pub fn adopted() -> Self {
        Self { gate: Gate::new() }
    }
}

/// Switches from `prev` to `next`.
///
/// # Safety
/// Both pointers must reference live contexts and `prev` must be the
/// caller's own. Interrupts must be disabled.
pub unsafe fn context_switch(prev: *mut Context, next: *mut Context, prev_exiting: bool) {
    // clone both gates before waking anyone: once `next` runs it may
    // reclaim an exiting `prev`'s descriptor page
    let prev_gate = unsafe { (*prev).gate.clone() };
    let next_gate = unsafe { (*next).gate.clone() };

    next_gate.release();
    if prev_exiting {
        // a dead thread never runs again: its carrier must not touch
        // kernel state anymore, matching the switch that never returns
        // on bare metal
        loop {
            std::thread::park();
        }
    }
    prev_gate.wait();
}
